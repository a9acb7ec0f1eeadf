//! Simulation kernels. The OpenCL sources live in the workspace `kernels/`
//! directory and are bundled here as a fallback; the host bodies mirror them
//! for the CPU backend.

#[cfg(feature = "cpu")]
use compute::{HostKernelLibrary, WorkItem};

#[cfg(feature = "cpu")]
use crate::model::{SystemState, ToggleSwitchParams, PARAM_COUNT};

pub const RNG_UNIFORM: &str = "rng_uniform";
pub const RNG_UNIFORM_SOURCE: &str = include_str!("../../../kernels/rng_uniform.cl");

pub const GILLESPIE_SWITCH: &str = "gillespie_switch";
pub const GILLESPIE_SWITCH_SOURCE: &str = include_str!("../../../kernels/gillespie_switch.cl");

pub use compute::kernels::fill_float_buffer::{
    NAME as FILL_FLOAT_BUFFER, SOURCE as FILL_FLOAT_BUFFER_SOURCE,
};

/// Uniforms drawn per system each step: waiting time and reaction pick.
pub const UNIFORMS_PER_SYSTEM: usize = 2;

fn mix32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Element `index` of the `rng_uniform` stream for a seed pair, in (0, 1].
#[must_use]
#[allow(clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn uniform(seed_a: i32, seed_b: i32, index: u32) -> f32 {
    let h = mix32(seed_a as u32 ^ mix32(index.wrapping_add((seed_b as u32).wrapping_mul(0x9e37_79b9))));
    ((h >> 8) + 1) as f32 * (1.0 / 16_777_216.0)
}

/// Host body of `rng_uniform(out, seed_a, seed_b, per_item)`.
///
/// # Errors
///
/// Argument type mismatches or an out-of-bounds write.
#[cfg(feature = "cpu")]
#[allow(clippy::cast_possible_truncation)]
pub fn rng_uniform(item: &mut WorkItem<'_>) -> compute::Result<()> {
    let seed_a = item.int_arg(1)?;
    let seed_b = item.int_arg(2)?;
    let per_item = usize::try_from(item.int_arg(3)?).unwrap_or(0);
    let len = item.buffer_len(0)?;
    let first = item.global_id() * per_item;
    for index in first..(first + per_item).min(len) {
        item.set_float(0, index, uniform(seed_a, seed_b, index as u32))?;
    }
    Ok(())
}

/// Host body of `gillespie_switch(p1, p2, dominant, time, params, rand,
/// switch_time, n)`.
///
/// # Errors
///
/// Argument type mismatches or an out-of-bounds access.
#[cfg(feature = "cpu")]
pub fn gillespie_switch(item: &mut WorkItem<'_>) -> compute::Result<()> {
    let i = item.global_id();
    let n = usize::try_from(item.int_arg(7)?).unwrap_or(0);
    if i >= n {
        return Ok(());
    }

    let mut packed = [0.0f32; PARAM_COUNT];
    for (j, value) in packed.iter_mut().enumerate() {
        *value = item.float_at(4, i * PARAM_COUNT + j)?;
    }
    let params = ToggleSwitchParams::from_vector(&packed);
    let mut state = SystemState {
        p1: item.int_at(0, i)?,
        p2: item.int_at(1, i)?,
        dominant: item.int_at(2, i)?,
        time: item.float_at(3, i)?,
    };
    let u1 = item.float_at(5, UNIFORMS_PER_SYSTEM * i)?;
    let u2 = item.float_at(5, UNIFORMS_PER_SYSTEM * i + 1)?;

    if let Some(residence) = state.react(&params, u1, u2) {
        item.set_float(6, i, residence)?;
    }
    item.set_int(0, i, state.p1)?;
    item.set_int(1, i, state.p2)?;
    item.set_int(2, i, state.dominant)?;
    item.set_float(3, i, state.time)
}

/// Engine built-ins plus the simulation kernels.
#[cfg(feature = "cpu")]
#[must_use]
pub fn host_library() -> HostKernelLibrary {
    let mut library = compute::kernels::builtin_library();
    library
        .register(RNG_UNIFORM, rng_uniform)
        .register(GILLESPIE_SWITCH, gillespie_switch);
    library
}
