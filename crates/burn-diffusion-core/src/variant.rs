//! Model variants and prediction parameterizations

use std::fmt;

use burn::constant;

use crate::error::ConfigError;

/// Stable Diffusion model family a checkpoint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    /// SD 1.x: CLIP ViT-L/14 text encoder, 768-wide cross attention
    SdV1,
    /// SD 2.x: OpenCLIP ViT-H text encoder, 1024-wide cross attention
    SdV2,
}

impl ModelVariant {
    /// Parses the `model_type` metadata field (`"SDv1"`, `"SDv2"`)
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "SDv1" => Ok(ModelVariant::SdV1),
            "SDv2" => Ok(ModelVariant::SdV2),
            _ => Err(ConfigError::UnknownVariant(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::SdV1 => "SDv1",
            ModelVariant::SdV2 => "SDv2",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the denoising network predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PredictionType {
    /// The noise that was added (epsilon)
    #[default]
    Epsilon,
    /// Velocity: `alpha * noise - sigma * sample`
    V,
}

impl PredictionType {
    /// Parses the `prediction_type` metadata field (`"epsilon"`, `"v"`)
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "epsilon" => Ok(PredictionType::Epsilon),
            "v" | "v_prediction" => Ok(PredictionType::V),
            _ => Err(ConfigError::UnknownPredictionType(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionType::Epsilon => "epsilon",
            PredictionType::V => "v",
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

burn::constant!(PredictionType);
