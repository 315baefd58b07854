use thiserror::Error;

/// Errors raised by the inference engine (GGUF parsing, weights, forward pass).
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GGUF parse error: {0}")]
    GgufParse(String),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid magic number: expected 0x46554747, got 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("Missing metadata key: {0}")]
    MissingKey(String),

    #[error("Type mismatch for key '{key}': expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown tensor type: {0}")]
    UnknownTensorType(u32),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Generation error: {0}")]
    Generation(String),
}

/// Errors surfaced by the safe [`LlamaModel`](crate::api::LlamaModel) API.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Model file not found at: {0}")]
    ModelNotFound(String),

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Failed to create context: {0}")]
    ContextCreationFailed(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<InferenceError> for BridgeError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::Generation(msg) => BridgeError::InferenceFailed(msg),
            other => BridgeError::ModelLoadFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_messages() {
        assert_eq!(
            BridgeError::ModelNotFound("/tmp/x.gguf".into()).to_string(),
            "Model file not found at: /tmp/x.gguf"
        );
        assert_eq!(
            BridgeError::ModelLoadFailed("bad magic".into()).to_string(),
            "Failed to load model: bad magic"
        );
        assert_eq!(
            BridgeError::ContextCreationFailed("n_ctx".into()).to_string(),
            "Failed to create context: n_ctx"
        );
        assert_eq!(
            BridgeError::InferenceFailed("eval".into()).to_string(),
            "Inference failed: eval"
        );
        assert_eq!(
            BridgeError::InvalidState("unloaded".into()).to_string(),
            "Invalid state: unloaded"
        );
    }

    #[test]
    fn test_inference_error_conversion() {
        let e: BridgeError = InferenceError::InvalidMagic(0xDEADBEEF).into();
        assert!(matches!(e, BridgeError::ModelLoadFailed(_)));
        assert!(e.to_string().contains("0xDEADBEEF"));

        let e: BridgeError = InferenceError::Generation("overflow".into()).into();
        assert!(matches!(e, BridgeError::InferenceFailed(ref m) if m == "overflow"));
    }
}
