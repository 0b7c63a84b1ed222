//! Configuration errors shared by every model constructor

use thiserror::Error;

/// Errors raised while configuring, loading or wiring up a model.
///
/// All of these are fatal to the operation that raised them: constructors
/// never hand back a partially initialized network.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown model variant: {0}")]
    UnknownVariant(String),

    #[error("unknown prediction type: {0}")]
    UnknownPredictionType(String),

    #[error("unknown precision: {0}")]
    UnknownPrecision(String),

    #[error("unknown activation function: {0}")]
    UnknownActivation(String),

    #[error("invalid adapter target: {0}")]
    InvalidTarget(String),

    #[error("missing metadata field: {0}")]
    MissingMetadata(&'static str),

    #[error("missing keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("shape mismatch for {key}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("LoRA {0} is missing its lora_up/lora_down weights")]
    IncompleteLora(String),

    #[error("unexpected key: {0}")]
    UnexpectedKey(String),

    #[error("unknown upscaler format")]
    UnknownUpscalerFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_lists_every_key() {
        let err = ConfigError::MissingKeys(vec!["conv_in.weight".into(), "conv_in.bias".into()]);
        assert_eq!(err.to_string(), "missing keys: conv_in.weight, conv_in.bias");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = ConfigError::ShapeMismatch {
            key: "proj.weight".into(),
            expected: vec![4, 8],
            actual: vec![8, 4],
        };
        assert!(err.to_string().contains("proj.weight"));
    }
}
