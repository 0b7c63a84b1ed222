//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

use burn_diffusion_core::{Metadata, WeightCollection};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(Dtype),
}

/// A memory-mapped safetensors file
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
    metadata: Option<HashMap<String, String>>,
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    /// Byte range inside the mapped file
    start: usize,
    end: usize,
}

impl SafeTensorFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // Safety: the file is only read, and the mapping lives as long as self
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let (_, header) = SafeTensors::read_metadata(&mmap)?;
        let metadata = header.metadata().clone();

        let st = SafeTensors::deserialize(&mmap)?;
        let base = mmap.as_ptr() as usize;
        let tensors = st
            .tensors()
            .into_iter()
            .map(|(name, view)| {
                let start = view.data().as_ptr() as usize - base;
                let info = TensorInfo {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    start,
                    end: start + view.data().len(),
                };
                (name, info)
            })
            .collect();

        Ok(Self {
            mmap,
            tensors,
            metadata,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    /// The `__metadata__` block of the header, if any
    pub fn metadata(&self) -> Option<&HashMap<String, String>> {
        self.metadata.as_ref()
    }

    /// Reads a tensor as f32 data, converting from fp16/bf16 if needed
    pub fn load_data(&self, name: &str) -> Result<TensorData, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;
        let data = &self.mmap[info.start..info.end];

        // mapped data may be unaligned, so values are read bytewise
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|chunk| f16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]])).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|chunk| bf16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]])).to_f32())
                .collect(),
            dtype => return Err(LoadError::UnsupportedDtype(dtype)),
        };

        Ok(TensorData::new(floats, info.shape.clone()))
    }

    /// Every float tensor and the header metadata as a [`WeightCollection`]
    ///
    /// Integer and bool tensors (such as CLIP `position_ids`) are left out.
    pub fn to_weights(&self) -> Result<WeightCollection, LoadError> {
        let mut weights = WeightCollection::new();
        let mut skipped = Vec::new();
        for (name, info) in &self.tensors {
            if !is_float(info.dtype) {
                skipped.push(name.as_str());
                continue;
            }
            weights.insert(name.clone(), self.load_data(name)?);
        }
        if !skipped.is_empty() {
            tracing::warn!(skipped = skipped.len(), names = ?skipped, "ignored non-float tensors");
        }
        weights.set_metadata(self.metadata.clone().map(Metadata::from_map));
        Ok(weights)
    }
}

fn is_float(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F32 | Dtype::F16 | Dtype::BF16)
}

/// Reads a whole checkpoint into memory
pub fn load_weights<P: AsRef<Path>>(path: P) -> Result<WeightCollection, LoadError> {
    let path = path.as_ref();
    let file = SafeTensorFile::open(path)?;
    let weights = file.to_weights()?;
    tracing::debug!(
        path = %path.display(),
        tensors = weights.len(),
        has_metadata = weights.metadata().is_some(),
        "loaded checkpoint"
    );
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_display() {
        let err = LoadError::TensorNotFound("missing".to_string());
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_open_missing_file() {
        let err = SafeTensorFile::open("/nonexistent/model.safetensors").err();
        assert!(matches!(err, Some(LoadError::Io(_))));
    }
}
