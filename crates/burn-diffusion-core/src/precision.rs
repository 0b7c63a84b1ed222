//! Numeric precision of loaded weights
//!
//! Checkpoints record the precision they were saved in as a metadata string
//! (`"float16"`, `"torch.bfloat16"`, `"fp32"`, ...). Constructors cast every
//! loaded tensor to the requested [`PrecisionMode`], falling back to the
//! checkpoint's own precision and finally to the backend's float type.
//!
//! # Note on backends
//!
//! Whether a backend can actually hold f16/bf16 tensors depends on the
//! backend (`NdArray<f32>` cannot, `Wgpu<f16>` can). Requesting a precision
//! the backend does not support is a backend error, not a configuration one.

use burn::tensor::DType;

use crate::error::ConfigError;

/// Precision mode for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionMode {
    /// Full 32-bit precision (default)
    #[default]
    Fp32,
    /// 16-bit half precision
    Fp16,
    /// 16-bit brain floating point
    Bf16,
}

impl PrecisionMode {
    /// Parses a checkpoint metadata precision string
    ///
    /// Accepts short names (`fp16`), numpy-style names (`float16`) and torch
    /// dtype reprs (`torch.float16`).
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let name = value.trim().trim_start_matches("torch.").to_ascii_lowercase();
        match name.as_str() {
            "fp32" | "f32" | "float32" | "float" => Ok(PrecisionMode::Fp32),
            "fp16" | "f16" | "float16" | "half" => Ok(PrecisionMode::Fp16),
            "bf16" | "bfloat16" => Ok(PrecisionMode::Bf16),
            _ => Err(ConfigError::UnknownPrecision(value.to_string())),
        }
    }

    /// Get a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            PrecisionMode::Fp32 => "fp32",
            PrecisionMode::Fp16 => "fp16",
            PrecisionMode::Bf16 => "bf16",
        }
    }

    /// Tensor dtype for this mode
    pub fn dtype(&self) -> DType {
        match self {
            PrecisionMode::Fp32 => DType::F32,
            PrecisionMode::Fp16 => DType::F16,
            PrecisionMode::Bf16 => DType::BF16,
        }
    }

    /// Memory footprint relative to fp32 (approximate)
    pub fn memory_savings(&self) -> f32 {
        match self {
            PrecisionMode::Fp32 => 1.0,
            PrecisionMode::Fp16 | PrecisionMode::Bf16 => 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_mode_default() {
        assert_eq!(PrecisionMode::default(), PrecisionMode::Fp32);
    }

    #[test]
    fn test_parse_accepts_torch_names() {
        assert_eq!(PrecisionMode::parse("torch.float16").unwrap(), PrecisionMode::Fp16);
        assert_eq!(PrecisionMode::parse("bfloat16").unwrap(), PrecisionMode::Bf16);
        assert_eq!(PrecisionMode::parse("FP32").unwrap(), PrecisionMode::Fp32);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(
            PrecisionMode::parse("int8"),
            Err(ConfigError::UnknownPrecision("int8".into()))
        );
    }

    #[test]
    fn test_dtype_mapping() {
        assert_eq!(PrecisionMode::Fp16.dtype(), DType::F16);
        assert_eq!(PrecisionMode::Fp16.memory_savings(), 0.5);
    }
}
