//! Flat weight collections
//!
//! A [`WeightCollection`] is the in-memory form of a checkpoint: a flat map
//! from dotted parameter keys (`down_blocks.0.resnets.1.conv1.weight`) to
//! tensor data, plus the optional metadata block that tells constructors which
//! variant, precision and prediction type the weights belong to.
//!
//! Collections are backend-agnostic; tensors are materialized on a device only
//! when a constructor reads them through [`WeightReader`](crate::params::WeightReader).

use std::collections::{BTreeMap, HashMap};

use burn::tensor::TensorData;

use crate::error::ConfigError;
use crate::precision::PrecisionMode;
use crate::variant::{ModelVariant, PredictionType};

/// Checkpoint metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Precision the weights were saved in
    pub dtype: Option<String>,
    /// Model family (`SDv1`, `SDv2`)
    pub model_type: Option<String>,
    /// Denoiser parameterization (`epsilon`, `v`)
    pub prediction_type: Option<String>,
    /// Any other string fields
    pub extra: BTreeMap<String, String>,
}

impl Metadata {
    /// Builds metadata from a raw string map (e.g. a safetensors header)
    pub fn from_map(map: HashMap<String, String>) -> Self {
        let mut metadata = Metadata::default();
        for (key, value) in map {
            match key.as_str() {
                "dtype" => metadata.dtype = Some(value),
                "model_type" => metadata.model_type = Some(value),
                "prediction_type" => metadata.prediction_type = Some(value),
                _ => {
                    metadata.extra.insert(key, value);
                }
            }
        }
        metadata
    }

    /// Looks up any field by name
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "dtype" => self.dtype.as_deref(),
            "model_type" => self.model_type.as_deref(),
            "prediction_type" => self.prediction_type.as_deref(),
            _ => self.extra.get(key).map(String::as_str),
        }
    }

    /// Parsed precision, if recorded
    pub fn precision(&self) -> Result<Option<PrecisionMode>, ConfigError> {
        self.dtype.as_deref().map(PrecisionMode::parse).transpose()
    }

    /// Parsed model variant; required
    pub fn variant(&self) -> Result<ModelVariant, ConfigError> {
        let value = self
            .model_type
            .as_deref()
            .ok_or(ConfigError::MissingMetadata("model_type"))?;
        ModelVariant::parse(value)
    }

    /// Parsed prediction type; required
    pub fn prediction_type(&self) -> Result<PredictionType, ConfigError> {
        let value = self
            .prediction_type
            .as_deref()
            .ok_or(ConfigError::MissingMetadata("prediction_type"))?;
        PredictionType::parse(value)
    }
}

/// Flat map from dotted key to tensor data
#[derive(Debug, Clone, Default)]
pub struct WeightCollection {
    tensors: BTreeMap<String, TensorData>,
    metadata: Option<Metadata>,
}

impl WeightCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a metadata block
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn set_metadata(&mut self, metadata: Option<Metadata>) {
        self.metadata = metadata;
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Metadata, or [`ConfigError::MissingMetadata`] naming the field the caller needed
    pub fn require_metadata(&self, field: &'static str) -> Result<&Metadata, ConfigError> {
        self.metadata.as_ref().ok_or(ConfigError::MissingMetadata(field))
    }

    /// Precision to load at: the explicit override, else the recorded one
    pub fn resolve_precision(
        &self,
        requested: Option<PrecisionMode>,
    ) -> Result<Option<PrecisionMode>, ConfigError> {
        match requested {
            Some(mode) => Ok(Some(mode)),
            None => match &self.metadata {
                Some(metadata) => metadata.precision(),
                None => Ok(None),
            },
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, data: TensorData) {
        self.tensors.insert(key.into(), data);
    }

    pub fn remove(&mut self, key: &str) -> Option<TensorData> {
        self.tensors.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&TensorData> {
        self.tensors.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn shape(&self, key: &str) -> Option<&[usize]> {
        self.tensors.get(key).map(|data| data.shape.as_slice())
    }

    /// Keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.tensors.iter().map(|(key, data)| (key.as_str(), data))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// First element of a tensor as f32 (alphas and other scalar entries)
    pub fn scalar(&self, key: &str) -> Option<f32> {
        let data = self.tensors.get(key)?;
        let values = data.clone().convert::<f32>().to_vec::<f32>().ok()?;
        values.first().copied()
    }

    /// Moves `from` to `to`, returning whether `from` existed
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.tensors.remove(from) {
            Some(data) => {
                self.tensors.insert(to.into(), data);
                true
            }
            None => false,
        }
    }

    /// Common first key segment, if every key shares one and it is not the whole key
    pub fn shared_root(&self) -> Option<&str> {
        let mut roots = self.tensors.keys().map(|key| key.split_once('.').map(|(root, _)| root));
        let first = roots.next()??;
        roots.all(|root| root == Some(first)).then_some(first)
    }

    /// Collection with `prefix` removed from every key; keys without it are dropped
    pub fn strip_prefix(&self, prefix: &str) -> Self {
        let tensors = self
            .tensors
            .iter()
            .filter_map(|(key, data)| {
                key.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), data.clone()))
            })
            .collect();

        Self {
            tensors,
            metadata: self.metadata.clone(),
        }
    }
}

impl FromIterator<(String, TensorData)> for WeightCollection {
    fn from_iter<I: IntoIterator<Item = (String, TensorData)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(shape: Vec<usize>) -> TensorData {
        let len = shape.iter().product();
        TensorData::new(vec![0.5f32; len], shape)
    }

    #[test]
    fn test_metadata_from_map() {
        let mut map = HashMap::new();
        map.insert("model_type".to_string(), "SDv2".to_string());
        map.insert("prediction_type".to_string(), "v".to_string());
        map.insert("activation_func".to_string(), "relu".to_string());

        let metadata = Metadata::from_map(map);
        assert_eq!(metadata.variant().unwrap(), ModelVariant::SdV2);
        assert_eq!(metadata.prediction_type().unwrap(), PredictionType::V);
        assert_eq!(metadata.get("activation_func"), Some("relu"));
        assert_eq!(metadata.precision().unwrap(), None);
    }

    #[test]
    fn test_metadata_missing_variant() {
        let metadata = Metadata::default();
        assert_eq!(
            metadata.variant(),
            Err(ConfigError::MissingMetadata("model_type"))
        );
    }

    #[test]
    fn test_resolve_precision_prefers_override() {
        let weights = WeightCollection::new().with_metadata(Metadata {
            dtype: Some("float16".into()),
            ..Default::default()
        });
        assert_eq!(
            weights.resolve_precision(None).unwrap(),
            Some(PrecisionMode::Fp16)
        );
        assert_eq!(
            weights.resolve_precision(Some(PrecisionMode::Fp32)).unwrap(),
            Some(PrecisionMode::Fp32)
        );
    }

    #[test]
    fn test_scalar_and_shape() {
        let mut weights = WeightCollection::new();
        weights.insert("layer.alpha", TensorData::new(vec![4.0f32], [1]));
        weights.insert("layer.weight", data(vec![2, 3]));

        assert_eq!(weights.scalar("layer.alpha"), Some(4.0));
        assert_eq!(weights.shape("layer.weight"), Some(&[2, 3][..]));
        assert_eq!(weights.scalar("missing"), None);
    }

    #[test]
    fn test_shared_root_and_strip() {
        let mut weights = WeightCollection::new();
        weights.insert("params_ema.conv_first.weight", data(vec![1]));
        weights.insert("params_ema.body.0.weight", data(vec![1]));
        assert_eq!(weights.shared_root(), Some("params_ema"));

        let stripped = weights.strip_prefix("params_ema.");
        assert!(stripped.contains("conv_first.weight"));
        assert!(stripped.contains("body.0.weight"));

        weights.insert("other.weight", data(vec![1]));
        assert_eq!(weights.shared_root(), None);
    }
}
