//! Adapter slots inside frozen networks
//!
//! Every sublayer that may receive adapters is an [`AdaptableLinear`] or
//! [`AdaptableConv`]. A fresh layer is plain: its forward is exactly the
//! wrapped layer's forward. Once an [`AdapterRegistry`](crate::registry::AdapterRegistry)
//! has scanned the network, the layer holds an [`AdapterHandle`] pointing at
//! the shared [`AdapterModule`] that LoRA and hypernetwork sets attach to.
//!
//! # Forward
//!
//! ```text
//! x   = x + hn(x)          for each hypernetwork, in attach order
//! out = original(x)
//! out = out + lora(x)      for each LoRA, in attach order
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use burn::module::{AutodiffModule, Content, ModuleDisplay, ModuleDisplayDefault};
use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::hypernetwork::HypernetworkModule;
use crate::lora::LowRankAdapter;

/// Atomic f32 strength shared by every attachment of one adapter
pub struct Multiplier(AtomicU32);

impl Multiplier {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl fmt::Debug for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Multiplier").field(&self.get()).finish()
    }
}

/// Adapter contributions for one wrapped sublayer
pub struct AdapterModule<B: Backend> {
    name: String,
    dim: usize,
    out_dim: usize,
    loras: Vec<Arc<LowRankAdapter<B>>>,
    hypernetworks: Vec<Arc<HypernetworkModule<B>>>,
}

impl<B: Backend> AdapterModule<B> {
    pub fn new(name: impl Into<String>, dim: usize, out_dim: usize) -> Self {
        Self {
            name: name.into(),
            dim,
            out_dim,
            loras: Vec::new(),
            hypernetworks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input dimension (features or channels) of the wrapped sublayer
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Output dimension of the wrapped sublayer
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Appends a LoRA; the same adapter may be attached more than once
    pub fn attach_lora(&mut self, lora: Arc<LowRankAdapter<B>>) {
        self.loras.push(lora);
    }

    /// Appends a hypernetwork module
    pub fn attach_hn(&mut self, hn: Arc<HypernetworkModule<B>>) {
        self.hypernetworks.push(hn);
    }

    /// Drops every attached adapter
    pub fn clear(&mut self) {
        self.loras.clear();
        self.hypernetworks.clear();
    }

    pub fn loras(&self) -> &[Arc<LowRankAdapter<B>>] {
        &self.loras
    }

    pub fn hypernetworks(&self) -> &[Arc<HypernetworkModule<B>>] {
        &self.hypernetworks
    }

    pub fn is_empty(&self) -> bool {
        self.loras.is_empty() && self.hypernetworks.is_empty()
    }

    /// Adapted forward for features on the last axis
    pub fn forward_last<const D: usize>(
        &self,
        x: Tensor<B, D>,
        original: impl FnOnce(Tensor<B, D>) -> Tensor<B, D>,
    ) -> Tensor<B, D> {
        let x = self
            .hypernetworks
            .iter()
            .fold(x, |x, hn| x.clone() + hn.forward(x));

        let out = original(x.clone());
        self.loras
            .iter()
            .fold(out, |out, lora| out + lora.forward_last(x.clone()))
    }

    /// Adapted forward for NCHW tensors, features on the channel axis
    pub fn forward_channels(
        &self,
        x: Tensor<B, 4>,
        original: impl FnOnce(Tensor<B, 4>) -> Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = if self.hypernetworks.is_empty() {
            x
        } else {
            let x = x.permute([0, 2, 3, 1]);
            let x = self
                .hypernetworks
                .iter()
                .fold(x, |x, hn| x.clone() + hn.forward(x));
            x.permute([0, 3, 1, 2])
        };

        let out = original(x.clone());
        self.loras
            .iter()
            .fold(out, |out, lora| out + lora.forward_channels(x.clone()))
    }
}

/// Shared reference to an [`AdapterModule`]
///
/// Held by the network's sublayer and by the registry that indexed it.
pub struct AdapterHandle<B: Backend>(Arc<RwLock<AdapterModule<B>>>);

impl<B: Backend> AdapterHandle<B> {
    pub fn new(name: impl Into<String>, dim: usize, out_dim: usize) -> Self {
        Self(Arc::new(RwLock::new(AdapterModule::new(name, dim, out_dim))))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AdapterModule<B>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AdapterModule<B>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.read().name().to_string()
    }

    pub fn dim(&self) -> usize {
        self.read().dim()
    }

    pub fn out_dim(&self) -> usize {
        self.read().out_dim()
    }

    pub fn attach_lora(&self, lora: Arc<LowRankAdapter<B>>) {
        self.write().attach_lora(lora);
    }

    pub fn attach_hn(&self, hn: Arc<HypernetworkModule<B>>) {
        self.write().attach_hn(hn);
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Whether both handles point at the same module
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<B: Backend> Clone for AdapterHandle<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: Backend> fmt::Debug for AdapterHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let module = self.read();
        f.debug_struct("AdapterHandle")
            .field("name", &module.name)
            .field("dim", &module.dim)
            .field("out_dim", &module.out_dim)
            .field("loras", &module.loras.len())
            .field("hypernetworks", &module.hypernetworks.len())
            .finish()
    }
}

impl<B: Backend> fmt::Display for AdapterHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let module = self.read();
        write!(
            f,
            "{} ({} lora, {} hn)",
            module.name,
            module.loras.len(),
            module.hypernetworks.len()
        )
    }
}

// Adapters hold no parameters of the host network; records and visitors
// skip them.
impl<B: Backend> Module<B> for AdapterHandle<B> {
    burn::constant!(module);
}

impl<B: AutodiffBackend> AutodiffModule<B> for AdapterHandle<B> {
    type InnerModule = AdapterHandle<B::InnerBackend>;

    fn valid(&self) -> Self::InnerModule {
        let module = self.read();
        AdapterHandle::new(module.name.clone(), module.dim, module.out_dim)
    }
}

impl<B: Backend> ModuleDisplayDefault for AdapterHandle<B> {
    fn content(&self, content: Content) -> Option<Content> {
        content.add_formatted(&self.to_string()).optional()
    }
}

impl<B: Backend> ModuleDisplay for AdapterHandle<B> {}

/// Linear layer with an optional adapter slot
#[derive(Module, Debug)]
pub struct AdaptableLinear<B: Backend> {
    pub inner: Linear<B>,
    adapter: Option<AdapterHandle<B>>,
}

impl<B: Backend> AdaptableLinear<B> {
    pub fn new(inner: Linear<B>) -> Self {
        Self {
            inner,
            adapter: None,
        }
    }

    /// Input features (burn stores linear weights as `[in, out]`)
    pub fn d_input(&self) -> usize {
        self.inner.weight.dims()[0]
    }

    pub fn d_output(&self) -> usize {
        self.inner.weight.dims()[1]
    }

    pub fn adapter(&self) -> Option<&AdapterHandle<B>> {
        self.adapter.as_ref()
    }

    /// Handle for this layer, creating it on first use
    pub(crate) fn adapter_or_insert(&mut self, name: &str) -> AdapterHandle<B> {
        let (dim, out_dim) = (self.d_input(), self.d_output());
        self.adapter
            .get_or_insert_with(|| AdapterHandle::new(name, dim, out_dim))
            .clone()
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match &self.adapter {
            None => self.inner.forward(x),
            Some(handle) => handle.read().forward_last(x, |x| self.inner.forward(x)),
        }
    }
}

/// 2D convolution with an optional adapter slot
///
/// Only 1x1 convolutions are ever adapted.
#[derive(Module, Debug)]
pub struct AdaptableConv<B: Backend> {
    pub inner: Conv2d<B>,
    adapter: Option<AdapterHandle<B>>,
}

impl<B: Backend> AdaptableConv<B> {
    pub fn new(inner: Conv2d<B>) -> Self {
        Self {
            inner,
            adapter: None,
        }
    }

    pub fn channels_in(&self) -> usize {
        self.inner.weight.dims()[1]
    }

    pub fn channels_out(&self) -> usize {
        self.inner.weight.dims()[0]
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        let [_, _, kh, kw] = self.inner.weight.dims();
        [kh, kw]
    }

    pub fn adapter(&self) -> Option<&AdapterHandle<B>> {
        self.adapter.as_ref()
    }

    pub(crate) fn adapter_or_insert(&mut self, name: &str) -> AdapterHandle<B> {
        let (dim, out_dim) = (self.channels_in(), self.channels_out());
        self.adapter
            .get_or_insert_with(|| AdapterHandle::new(name, dim, out_dim))
            .clone()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.adapter {
            None => self.inner.forward(x),
            Some(handle) => handle
                .read()
                .forward_channels(x, |x| self.inner.forward(x)),
        }
    }
}
