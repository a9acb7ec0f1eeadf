use std::io;
use std::path::PathBuf;

use compute::ComputeError;
use thiserror::Error;

pub type Result<T, E = SimError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("measurement sink `{}`: {source}", path.display())]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid simulation config: {0}")]
    Config(String),
}
