use thiserror::Error;

/// Which side of a stage invocation a tensor was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingDirection {
    Input,
    Output,
}

impl std::fmt::Display for BindingDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error(
        "managed {direction} {tensor} resides on the primary device type ({device}), \
         but stage {stage} is expecting it to reside elsewhere"
    )]
    DeviceMismatch {
        stage: String,
        tensor: String,
        direction: BindingDirection,
        device: String,
    },

    #[error("device type {0} is not supported in pipeline models")]
    UnsupportedDeviceType(String),

    #[error("stage {stage} failed: {source}")]
    Backend {
        stage: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("stage {stage} did not produce requested output {output}")]
    MissingOutput { stage: String, output: String },

    #[error("{strategy} search does not support {operation}")]
    UnsupportedOperation {
        strategy: &'static str,
        operation: &'static str,
    },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    #[error("sequence overflow: capacity {capacity} reached")]
    SequenceOverflow { capacity: usize },

    #[error("invalid rollback: requested {requested}, available {available}")]
    InvalidRollback { requested: usize, available: usize },

    #[error("logits must be computed before selecting the next token")]
    LogitsNotComputed,

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, GenerationError>;

impl GenerationError {
    pub(crate) fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::Shape {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
