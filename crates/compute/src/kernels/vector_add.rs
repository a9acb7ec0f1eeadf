#[cfg(feature = "cpu")]
use crate::backend::cpu::WorkItem;
#[cfg(feature = "cpu")]
use crate::Result;

pub const NAME: &str = "vector_add";

/// `c[i] = a[i] + b[i]` for `i < n`.
pub const SOURCE: &str = include_str!("../../../../kernels/vector_add.cl");

#[cfg(feature = "cpu")]
pub fn run(item: &mut WorkItem<'_>) -> Result<()> {
    let i = item.global_id();
    let n = usize::try_from(item.int_arg(3)?).unwrap_or(0);
    if i >= n {
        return Ok(());
    }
    let sum = item.float_at(0, i)? + item.float_at(1, i)?;
    item.set_float(2, i, sum)
}
