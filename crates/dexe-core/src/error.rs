use crate::shape::Shape;

/// All errors that can occur within dexe.
///
/// Variants fall into four groups. Configuration errors are the caller's to
/// fix (bad shapes, graph built in the wrong order). Backend errors mean the
/// numeric backend refused a call and the current training step is lost.
/// Serialization errors only fail the load/save call that raised them.
/// Dataset errors come from a training-data source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Adjacent operations disagree on the shape flowing between them.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Two buffers that must be the same length are not.
    #[error("length mismatch: expected {expected} elements, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    /// An operation was configured with values it cannot work with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `add_operation` or `finish` after the graph was frozen.
    #[error("network is already finished; the operation sequence is frozen")]
    AlreadyFinished,

    /// forward/backward/update before `finish`.
    #[error("network is not finished; call finish() first")]
    NotFinished,

    /// Label index outside the configured class count.
    #[error("label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },

    /// Tensor data accessed before allocation.
    #[error("tensor of shape {shape} is not allocated")]
    Unallocated { shape: Shape },

    /// A parametrised operation used before its parameter range was bound.
    #[error("operation '{op}' has no parameter range bound")]
    Unbound { op: &'static str },

    /// A parameter range reaches past the end of the flat buffer.
    #[error("parameter range {offset}..{end} exceeds flat buffer of {len}")]
    RangeOutOfBounds {
        offset: usize,
        end: usize,
        len: usize,
    },

    /// backward called on an operation that needs state from forward.
    #[error("operation '{op}' has no cached forward state")]
    MissingForwardCache { op: &'static str },

    /// The numeric backend failed. Not recoverable within the current step.
    #[error("backend failure ({code}): {message}")]
    Backend { code: &'static str, message: String },

    /// Persisted parameter count does not match the live graph.
    #[error("parameter count mismatch: network has {expected}, file has {got}")]
    ParamCountMismatch { expected: usize, got: usize },

    /// Malformed parameter file.
    #[error("invalid parameter file: {0}")]
    Checkpoint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Training-data source failure.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a backend failure with a status code and description.
    pub fn backend(code: &'static str, message: impl Into<String>) -> Self {
        Error::Backend {
            code,
            message: message.into(),
        }
    }

    /// Errors the caller can fix by correcting the graph or its inputs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::ShapeMismatch { .. }
                | Error::LengthMismatch { .. }
                | Error::InvalidConfig(_)
                | Error::AlreadyFinished
                | Error::NotFinished
                | Error::LabelOutOfRange { .. }
                | Error::Unallocated { .. }
                | Error::Unbound { .. }
                | Error::RangeOutOfBounds { .. }
                | Error::MissingForwardCache { .. }
        )
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend { .. })
    }

    pub fn is_serialization(&self) -> bool {
        matches!(
            self,
            Error::ParamCountMismatch { .. } | Error::Checkpoint(_) | Error::Io(_)
        )
    }
}

/// Convenience Result type used throughout dexe.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
