use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::ElementType;
use crate::signature::SignatureError;

pub type Result<T, E = ComputeError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("no platform matches device category `{category}` (available: {available:?})")]
    DeviceNotFound {
        category: String,
        available: Vec<String>,
    },
    #[error("kernel `{kernel}` failed to compile: {diagnostic}")]
    KernelCompile { kernel: String, diagnostic: String },
    #[error("kernel `{kernel}` has an invalid signature")]
    Signature {
        kernel: String,
        #[source]
        source: SignatureError,
    },
    #[error("kernel `{kernel}`: argument {position} has no bound resource ({bound} of {expected} bound)")]
    ArgumentBindingIncomplete {
        kernel: String,
        position: usize,
        expected: usize,
        bound: usize,
    },
    #[error("kernel `{kernel}` declares {expected} arguments but its pools hold {found} resources")]
    UnusedResources {
        kernel: String,
        expected: usize,
        found: usize,
    },
    #[error("cannot alias {element:?} buffer slot {slot} of kernel `{kernel}`: no buffer exists there")]
    AliasResolution {
        kernel: String,
        element: ElementType,
        slot: usize,
    },
    #[error("unknown kernel `{0}`")]
    UnknownKernel(String),
    #[error("source for kernel `{kernel}` not found (searched {searched:?})")]
    KernelSourceNotFound {
        kernel: String,
        searched: Vec<PathBuf>,
    },
    #[error("failed to read kernel source {path:?}")]
    KernelSourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel `{0}` already has bound arguments; use rebind")]
    AlreadyBound(String),
    #[error("kernel `{0}` has no complete binding to rebind")]
    NotBound(String),
    #[error("invalid work size (global {global}, local {local}): {reason}")]
    InvalidWorkSize {
        global: usize,
        local: usize,
        reason: &'static str,
    },
    #[error("fill source has {found} elements, buffer has {expected}")]
    FillLength { expected: usize, found: usize },
    #[error("tiled fill needs a non-empty source")]
    EmptyTileSource,
    #[error("read of {requested} elements from position {position} exceeds buffer length {len}")]
    ReadOutOfRange {
        requested: usize,
        position: usize,
        len: usize,
    },
    #[error("kernel `{kernel}` has no {what} in slot {slot}")]
    SlotOutOfRange {
        kernel: String,
        what: &'static str,
        slot: usize,
    },
    #[error("expected a {expected:?} buffer, found a {found:?} buffer")]
    ElementMismatch {
        expected: ElementType,
        found: ElementType,
    },
    #[error("argument {index}: expected {expected}")]
    ArgumentType { index: usize, expected: &'static str },
    #[error("backend error: {0}")]
    Backend(String),
}
