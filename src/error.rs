use crate::bytecode::DecodeError;
use crate::value::Value;

/// Failures that end an activation and are handed back to its caller.
///
/// Everything else the interpreter meets (bad registers, bad pool indices,
/// uncallable callees) is logged and degraded in place.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("structural decode failure at offset {offset}: {source}")]
    StructuralDecode {
        offset: usize,
        #[source]
        source: DecodeError,
    },
    #[error("uncaught exception: {0}")]
    Thrown(Value),
    #[error("call depth limit of {limit} exceeded")]
    CallDepthExceeded { limit: usize },
}

pub type VmResult<T> = Result<T, VmError>;
