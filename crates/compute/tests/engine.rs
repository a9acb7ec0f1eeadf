#![cfg(feature = "cpu")]

use std::fs;
use std::path::PathBuf;

use compute::kernels::{self, fill_float_buffer, vector_add};
use compute::{
    AccessMode, ArgumentKind, ComputeContext, ComputeError, ContextConfig, CpuBackend,
    DeviceCategory, ElementType, Fill, HostKernelLibrary, SignatureError, WorkItem,
};

const SCALE_SRC: &str = r"
// a[i] = i + 10 * b[i] for the first n items
__kernel void scale(__global int* a, __global float* b, int n)
{
    int i = get_global_id(0);
    if (i < n) a[i] = i + (int)(10.0f * b[i]);
}
";

const GROUP_SUM_SRC: &str = r"
__kernel void group_sum(__global const float* input,
                        __global float* sums,
                        __local float* scratch)
{
}
";

const SCRATCH_FIRST_SRC: &str = r"
__kernel void scratch_first(__local float* scratch, __global float* out)
{
}
";

fn scratch_first(item: &mut WorkItem<'_>) -> compute::Result<()> {
    let lid = item.local_id();
    item.set_float(0, lid, 9.0)?;
    let v = item.float_at(0, lid)?;
    item.set_float(1, item.global_id(), v)
}

fn scale(item: &mut WorkItem<'_>) -> compute::Result<()> {
    let i = item.global_id();
    let n = usize::try_from(item.int_arg(2)?).unwrap_or(0);
    if i < n {
        let b = item.float_at(1, i)?;
        item.set_int(0, i, i as i32 + (10.0 * b) as i32)?;
    }
    Ok(())
}

// Work items of a group run in order, so the last one sees every partial sum.
fn group_sum(item: &mut WorkItem<'_>) -> compute::Result<()> {
    let lid = item.local_id();
    let value = item.float_at(0, item.global_id())?;
    let previous = if lid == 0 { 0.0 } else { item.float_at(2, lid - 1)? };
    item.set_float(2, lid, previous + value)?;
    if lid + 1 == item.local_size() {
        let total = item.float_at(2, lid)?;
        item.set_float(1, item.group_id(), total)?;
    }
    Ok(())
}

fn context() -> ComputeContext<CpuBackend> {
    let mut library = kernels::builtin_library();
    library.extend(
        HostKernelLibrary::new()
            .with("scale", scale)
            .with("group_sum", group_sum)
            .with("scratch_first", scratch_first),
    );
    ComputeContext::open(ContextConfig::default(), library).unwrap()
}

fn scale_kernel(ctx: &mut ComputeContext<CpuBackend>) {
    ctx.register_kernel_source("scale", SCALE_SRC).unwrap();
    ctx.create_int_buffer("scale", 0, 10, AccessMode::ReadWrite, Fill::Broadcast(0))
        .unwrap();
    ctx.create_float_buffer("scale", 0, 10, AccessMode::ReadOnly, Fill::Broadcast(1.5))
        .unwrap();
    ctx.create_int_arg("scale", 0, 10).unwrap();
}

fn vector_add_kernel(ctx: &mut ComputeContext<CpuBackend>, len: usize) {
    ctx.register_kernel_source(vector_add::NAME, vector_add::SOURCE)
        .unwrap();
    ctx.create_float_buffer(vector_add::NAME, 0, len, AccessMode::ReadOnly, Fill::Broadcast(3.0))
        .unwrap();
    ctx.create_float_buffer(vector_add::NAME, 1, len, AccessMode::ReadOnly, Fill::Broadcast(3.25))
        .unwrap();
    ctx.create_float_buffer(vector_add::NAME, 2, len, AccessMode::ReadWrite, Fill::Zeroed)
        .unwrap();
    ctx.create_int_arg(vector_add::NAME, 0, i32::try_from(len).unwrap())
        .unwrap();
}

#[test]
fn end_to_end_int_float_scalar_kernel() {
    let mut ctx = context();
    scale_kernel(&mut ctx);

    let sig = ctx.signature("scale").unwrap();
    let kinds: Vec<_> = sig.iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        [ArgumentKind::IntBuffer, ArgumentKind::FloatBuffer, ArgumentKind::IntScalar]
    );

    assert_eq!(ctx.bind("scale").unwrap(), 3);
    ctx.dispatch("scale", 10, 1).unwrap();
    let a = ctx.read_int_buffer("scale", 0, 10).unwrap();
    assert_eq!(a.len(), 10);
    assert_eq!(a, (15..25).collect::<Vec<_>>());
    ctx.close().unwrap();
}

#[test]
fn dispatch_refused_until_every_position_is_bound() {
    let mut ctx = context();
    ctx.register_kernel_source("scale", SCALE_SRC).unwrap();
    ctx.create_int_buffer("scale", 0, 10, AccessMode::ReadWrite, Fill::Zeroed)
        .unwrap();
    ctx.create_int_arg("scale", 0, 10).unwrap();

    // Never bound.
    let err = ctx.dispatch("scale", 10, 1).unwrap_err();
    assert!(
        matches!(err, ComputeError::ArgumentBindingIncomplete { position: 1, .. }),
        "{err:?}"
    );

    // Bind fails at the missing float buffer and leaves the kernel disabled.
    let err = ctx.bind("scale").unwrap_err();
    assert!(
        matches!(
            err,
            ComputeError::ArgumentBindingIncomplete {
                position: 1,
                expected: 3,
                bound: 1,
                ..
            }
        ),
        "{err:?}"
    );
    assert!(matches!(
        ctx.assert_binding_complete("scale"),
        Err(ComputeError::ArgumentBindingIncomplete { .. })
    ));
    assert!(ctx.dispatch("scale", 10, 1).is_err());

    ctx.create_float_buffer("scale", 0, 10, AccessMode::ReadOnly, Fill::Broadcast(0.0))
        .unwrap();
    assert_eq!(ctx.bind("scale").unwrap(), 3);
    ctx.assert_binding_complete("scale").unwrap();
    ctx.dispatch("scale", 10, 1).unwrap();
}

#[test]
fn rebind_preserves_arity() {
    let mut ctx = context();
    scale_kernel(&mut ctx);
    let arity = ctx.bind("scale").unwrap();
    for step in 0..5 {
        ctx.create_int_arg("scale", 0, step).unwrap();
        assert_eq!(ctx.rebind("scale").unwrap(), arity);
        assert_eq!(ctx.rebind_scalars("scale").unwrap(), arity);
        ctx.dispatch("scale", 10, 2).unwrap();
    }
    let a = ctx.read_int_buffer("scale", 0, 10).unwrap();
    // Last dispatch ran with n = 4 over buffers re-uploaded as zeros.
    assert_eq!(&a[..4], &[15, 16, 17, 18]);
    assert!(a[4..].iter().all(|&v| v == 0));
}

#[test]
fn bind_and_rebind_preconditions() {
    let mut ctx = context();
    scale_kernel(&mut ctx);
    assert!(matches!(ctx.rebind("scale"), Err(ComputeError::NotBound(_))));
    assert!(matches!(ctx.rebind_scalars("scale"), Err(ComputeError::NotBound(_))));
    ctx.bind("scale").unwrap();
    assert!(matches!(ctx.bind("scale"), Err(ComputeError::AlreadyBound(_))));
    assert!(matches!(ctx.bind("missing"), Err(ComputeError::UnknownKernel(_))));
}

#[test]
fn aliased_buffer_is_shared_not_copied() {
    let mut ctx = context();
    vector_add_kernel(&mut ctx, 16);
    ctx.register_kernel_source(fill_float_buffer::NAME, fill_float_buffer::SOURCE)
        .unwrap();
    let original = ctx.buffer(vector_add::NAME, ElementType::Float, 2).unwrap();
    let alias = ctx
        .alias_float_buffer(vector_add::NAME, 2, fill_float_buffer::NAME, 0)
        .unwrap();
    assert_eq!(original.id(), alias.id());
    ctx.create_float_arg(fill_float_buffer::NAME, 0, 7.5).unwrap();
    ctx.bind(vector_add::NAME).unwrap();
    ctx.bind(fill_float_buffer::NAME).unwrap();

    ctx.dispatch(vector_add::NAME, 16, 4).unwrap();
    let sums = ctx.read_float_buffer(fill_float_buffer::NAME, 0, 16).unwrap();
    assert!(sums.iter().all(|&v| v == 6.25), "{sums:?}");

    ctx.dispatch(fill_float_buffer::NAME, 16, 4).unwrap();
    let filled = ctx.read_float_buffer(vector_add::NAME, 2, 16).unwrap();
    assert!(filled.iter().all(|&v| v == 7.5), "{filled:?}");

    // A host write through one kernel is visible through the other.
    ctx.write_float_buffer(vector_add::NAME, 2, 3, &[-1.0]).unwrap();
    let through_alias = ctx.read_float_buffer(fill_float_buffer::NAME, 0, 4).unwrap();
    assert_eq!(through_alias, vec![7.5, 7.5, 7.5, -1.0]);
}

#[test]
fn alias_of_missing_buffer_is_refused() {
    let mut ctx = context();
    vector_add_kernel(&mut ctx, 4);
    ctx.register_kernel_source(fill_float_buffer::NAME, fill_float_buffer::SOURCE)
        .unwrap();
    let err = ctx
        .alias_float_buffer(vector_add::NAME, 5, fill_float_buffer::NAME, 0)
        .unwrap_err();
    assert!(
        matches!(err, ComputeError::AliasResolution { slot: 5, element: ElementType::Float, .. }),
        "{err:?}"
    );
    assert!(matches!(
        ctx.alias_int_buffer(vector_add::NAME, 0, fill_float_buffer::NAME, 0),
        Err(ComputeError::AliasResolution { .. })
    ));
    assert!(matches!(
        ctx.alias_float_buffer("nope", 0, fill_float_buffer::NAME, 0),
        Err(ComputeError::AliasResolution { .. })
    ));
    assert_eq!(ctx.kernel(fill_float_buffer::NAME).unwrap().pool().resource_count(), 0);
}

#[test]
fn readback_rewinds_the_cursor() {
    let k = 5;
    let mut ctx = context();
    ctx.register_kernel_source("scale", SCALE_SRC).unwrap();
    let data: Vec<i32> = (100..100 + 2 * k as i32).collect();
    let handle = ctx
        .create_int_buffer("scale", 0, 2 * k, AccessMode::ReadWrite, Fill::Exact(&data))
        .unwrap();

    let first = ctx.read_int_buffer("scale", 0, k).unwrap();
    assert_eq!(handle.position(), 0);
    let second = ctx.read_int_buffer("scale", 0, k).unwrap();
    assert_eq!(first, &data[..k]);
    assert_eq!(second, &data[..k]);

    assert_eq!(handle.take::<i32>(k).unwrap(), &data[..k]);
    assert_eq!(handle.take::<i32>(k).unwrap(), &data[k..]);
    handle.rewind();
    assert_eq!(handle.take::<i32>(k).unwrap(), &data[..k]);
    handle.rewind();

    // An oversized read fails and still leaves the cursor at the start.
    assert!(matches!(
        ctx.read_int_buffer("scale", 0, 2 * k + 1),
        Err(ComputeError::ReadOutOfRange { .. })
    ));
    assert_eq!(handle.position(), 0);
    assert!(matches!(
        ctx.read_float_buffer("scale", 0, 1),
        Err(ComputeError::SlotOutOfRange { .. })
    ));
}

#[test]
fn tiled_buffer_replicates_parameter_vector() {
    let mut ctx = context();
    ctx.register_kernel_source("scale", SCALE_SRC).unwrap();
    let params = [40.0f32, 40.0, 4.0, 4.0, 2.0, 2.0, 4.0, 4.0, 160.0, 0.0];
    ctx.create_float_buffer("scale", 0, 10 * 64, AccessMode::ReadOnly, Fill::Tiled(&params))
        .unwrap();
    let values = ctx.read_float_buffer("scale", 0, 10 * 64).unwrap();
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, params[i % params.len()]);
    }
}

#[test]
fn rebind_scalars_leaves_device_buffers_alone() {
    let mut ctx = context();
    vector_add_kernel(&mut ctx, 8);
    ctx.bind(vector_add::NAME).unwrap();
    ctx.dispatch(vector_add::NAME, 8, 8).unwrap();
    ctx.finish().unwrap();

    let out = ctx.buffer(vector_add::NAME, ElementType::Float, 2).unwrap();
    assert!(!out.upload_pending());

    ctx.create_int_arg(vector_add::NAME, 0, 4).unwrap();
    ctx.rebind_scalars(vector_add::NAME).unwrap();
    assert!(!out.upload_pending());
    ctx.dispatch(vector_add::NAME, 8, 8).unwrap();
    // Device results of the first launch survive; only n changed.
    assert_eq!(ctx.read_float_buffer(vector_add::NAME, 2, 8).unwrap(), vec![6.25; 8]);

    ctx.rebind(vector_add::NAME).unwrap();
    assert!(out.upload_pending());
}

#[test]
fn local_scratch_is_sized_from_the_pool() {
    let mut ctx = context();
    ctx.register_kernel_source("group_sum", GROUP_SUM_SRC).unwrap();
    let sig = ctx.signature("group_sum").unwrap();
    assert_eq!(sig.get(2).unwrap().scope, compute::MemoryScope::Local);

    let input: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    ctx.create_float_buffer("group_sum", 0, 16, AccessMode::ReadOnly, Fill::Exact(&input))
        .unwrap();
    ctx.create_float_buffer("group_sum", 1, 4, AccessMode::WriteOnly, Fill::Zeroed)
        .unwrap();
    ctx.create_float_buffer("group_sum", 2, 4, AccessMode::ReadWrite, Fill::Zeroed)
        .unwrap();
    ctx.bind("group_sum").unwrap();
    ctx.dispatch("group_sum", 16, 4).unwrap();
    assert_eq!(
        ctx.read_float_buffer("group_sum", 1, 4).unwrap(),
        vec![10.0, 26.0, 42.0, 58.0]
    );
}

#[test]
fn local_scratch_before_a_global_buffer() {
    let mut ctx = context();
    ctx.register_kernel_source("scratch_first", SCRATCH_FIRST_SRC).unwrap();
    ctx.create_float_buffer("scratch_first", 0, 2, AccessMode::ReadWrite, Fill::Zeroed)
        .unwrap();
    ctx.create_float_buffer("scratch_first", 1, 8, AccessMode::ReadWrite, Fill::Zeroed)
        .unwrap();
    ctx.bind("scratch_first").unwrap();
    ctx.dispatch("scratch_first", 8, 2).unwrap();
    assert_eq!(ctx.read_float_buffer("scratch_first", 1, 8).unwrap(), vec![9.0; 8]);
    // The scratch slot is never written back.
    assert_eq!(ctx.read_float_buffer("scratch_first", 0, 2).unwrap(), vec![0.0; 2]);
}

#[test]
fn device_memory_counts_every_attached_buffer() {
    let mut ctx = context();
    vector_add_kernel(&mut ctx, 1000);
    assert_eq!(ctx.device_memory_used(vector_add::NAME).unwrap(), 3 * 1000 * 4);
    ctx.register_kernel_source(fill_float_buffer::NAME, fill_float_buffer::SOURCE)
        .unwrap();
    assert_eq!(ctx.device_memory_used(fill_float_buffer::NAME).unwrap(), 0);
    ctx.alias_float_buffer(vector_add::NAME, 2, fill_float_buffer::NAME, 0)
        .unwrap();
    assert_eq!(ctx.device_memory_used(fill_float_buffer::NAME).unwrap(), 4000);
}

#[test]
fn work_size_must_divide() {
    let mut ctx = context();
    vector_add_kernel(&mut ctx, 10);
    ctx.bind(vector_add::NAME).unwrap();
    for (global, local) in [(10, 3), (10, 0), (0, 1), (2048, 2048)] {
        assert!(matches!(
            ctx.dispatch(vector_add::NAME, global, local),
            Err(ComputeError::InvalidWorkSize { .. })
        ));
    }
}

#[test]
fn scalar_slots_overwrite_in_place() {
    let mut ctx = context();
    scale_kernel(&mut ctx);
    ctx.create_int_arg("scale", 0, 3).unwrap();
    ctx.create_long_arg("scale", 4, -7).unwrap();
    ctx.create_float_arg("scale", 1, 0.5).unwrap();
    assert_eq!(ctx.int_arg("scale", 0).unwrap(), 3);
    assert_eq!(ctx.long_arg("scale", 4).unwrap(), -7);
    assert_eq!(ctx.float_arg("scale", 1).unwrap(), 0.5);
    assert!(matches!(
        ctx.long_arg("scale", 0),
        Err(ComputeError::SlotOutOfRange { .. })
    ));
    // Extra resources make the pool disagree with the signature.
    assert!(matches!(
        ctx.bind("scale"),
        Err(ComputeError::UnusedResources { expected: 3, found: 5, .. })
    ));
}

#[test]
fn surplus_scalar_after_bind_refuses_dispatch() {
    let mut ctx = context();
    scale_kernel(&mut ctx);
    ctx.bind("scale").unwrap();
    ctx.create_int_arg("scale", 1, 6).unwrap();
    assert!(matches!(
        ctx.dispatch("scale", 10, 1),
        Err(ComputeError::UnusedResources { expected: 3, found: 4, .. })
    ));
    assert!(ctx.assert_binding_complete("scale").is_err());
}

#[test]
fn replaced_buffer_refuses_dispatch_until_rebind() {
    let mut ctx = context();
    scale_kernel(&mut ctx);
    ctx.bind("scale").unwrap();
    ctx.create_int_buffer("scale", 0, 10, AccessMode::ReadWrite, Fill::Broadcast(1))
        .unwrap();
    let refused = |ctx: &ComputeContext<CpuBackend>| {
        matches!(
            ctx.dispatch("scale", 10, 1),
            Err(ComputeError::ArgumentBindingIncomplete { position: 0, expected: 3, .. })
        )
    };
    assert!(refused(&ctx));
    // Scalars alone do not attach the new buffer.
    ctx.rebind_scalars("scale").unwrap();
    assert!(refused(&ctx));

    ctx.rebind("scale").unwrap();
    ctx.dispatch("scale", 10, 1).unwrap();
    assert_eq!(
        ctx.read_int_buffer("scale", 0, 10).unwrap(),
        (15..25).collect::<Vec<_>>()
    );
}

#[test]
fn alias_over_a_bound_buffer_refuses_dispatch_until_rebind() {
    let mut ctx = context();
    vector_add_kernel(&mut ctx, 8);
    ctx.register_kernel_source(fill_float_buffer::NAME, fill_float_buffer::SOURCE)
        .unwrap();
    ctx.create_float_buffer(fill_float_buffer::NAME, 0, 8, AccessMode::ReadWrite, Fill::Zeroed)
        .unwrap();
    ctx.create_float_arg(fill_float_buffer::NAME, 0, 2.0).unwrap();
    ctx.bind(fill_float_buffer::NAME).unwrap();

    ctx.alias_float_buffer(vector_add::NAME, 2, fill_float_buffer::NAME, 0)
        .unwrap();
    assert!(matches!(
        ctx.dispatch(fill_float_buffer::NAME, 8, 4),
        Err(ComputeError::ArgumentBindingIncomplete { position: 0, .. })
    ));
    ctx.rebind(fill_float_buffer::NAME).unwrap();
    ctx.dispatch(fill_float_buffer::NAME, 8, 4).unwrap();
    assert_eq!(ctx.read_float_buffer(vector_add::NAME, 2, 8).unwrap(), vec![2.0; 8]);
}

#[test]
fn registration_errors_carry_context() {
    let mut ctx = context();
    let err = ctx
        .register_kernel_source("bad", "__kernel void bad(global int* a, double x) {}")
        .unwrap_err();
    match err {
        ComputeError::Signature { kernel, source } => {
            assert_eq!(kernel, "bad");
            assert_eq!(
                source,
                SignatureError::UnrecognizedArgumentType {
                    index: 1,
                    fragment: "double x".to_owned()
                }
            );
        }
        other => panic!("unexpected {other:?}"),
    }

    // Parses, but the device has no implementation for it.
    let err = ctx
        .register_kernel_source("orphan", "__kernel void orphan(global float* x) {}")
        .unwrap_err();
    assert!(matches!(err, ComputeError::KernelCompile { .. }), "{err:?}");

    // Other kernels are unaffected.
    scale_kernel(&mut ctx);
    ctx.bind("scale").unwrap();
    assert!(ctx.kernel("orphan").is_err());
}

#[test]
fn kernel_source_is_found_by_name() {
    let dir: PathBuf = std::env::temp_dir().join(format!("compute-kernels-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("scale.cl"), SCALE_SRC).unwrap();

    let mut ctx = context();
    assert_eq!(ctx.register_kernel("scale", Some(dir.as_path())).unwrap().len(), 3);
    assert_eq!(
        ctx.register_kernel("scale", Some(dir.join("scale.cl").as_path()))
            .unwrap()
            .len(),
        3
    );

    let mut searching = ComputeContext::<CpuBackend>::open(
        ContextConfig::default().with_kernel_dir(&dir),
        kernels::builtin_library().with("scale", scale),
    )
    .unwrap();
    searching.register_kernel("scale", None).unwrap();

    let err = searching.register_kernel("vector_sub", None).unwrap_err();
    match err {
        ComputeError::KernelSourceNotFound { kernel, searched } => {
            assert_eq!(kernel, "vector_sub");
            assert_eq!(searched.len(), 3);
            assert_eq!(searched[0], dir.join("vector_sub.cl"));
        }
        other => panic!("unexpected {other:?}"),
    }
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn reregistration_keeps_the_pool() {
    let mut ctx = context();
    scale_kernel(&mut ctx);
    ctx.bind("scale").unwrap();
    ctx.register_kernel_source("scale", SCALE_SRC).unwrap();
    assert!(!ctx.kernel("scale").unwrap().is_bound());
    assert_eq!(ctx.kernel("scale").unwrap().pool().resource_count(), 3);
    ctx.bind("scale").unwrap();
}

#[test]
fn gpu_is_not_substituted_with_host() {
    let err = ComputeContext::<CpuBackend>::open(
        ContextConfig::default().with_device(DeviceCategory::parse("GPU")),
        HostKernelLibrary::new(),
    )
    .unwrap_err();
    assert!(matches!(err, ComputeError::DeviceNotFound { .. }), "{err:?}");
}

#[test]
fn dump_returns_what_it_logs() {
    let mut ctx = context();
    scale_kernel(&mut ctx);
    let values = ctx.dump_buffer::<f32>("scale", 0, 3).unwrap();
    assert_eq!(values, vec![1.5; 3]);
}
