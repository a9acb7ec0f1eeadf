#[cfg(feature = "cpu")]
use crate::backend::cpu::WorkItem;
#[cfg(feature = "cpu")]
use crate::Result;

pub const NAME: &str = "fill_float_buffer";

/// Sets every element of `buf` to `value`; one work item per element.
pub const SOURCE: &str = include_str!("../../../../kernels/fill_float_buffer.cl");

#[cfg(feature = "cpu")]
pub fn run(item: &mut WorkItem<'_>) -> Result<()> {
    let i = item.global_id();
    if i >= item.buffer_len(0)? {
        return Ok(());
    }
    let value = item.float_arg(1)?;
    item.set_float(0, i, value)
}
