//! Adapter registry
//!
//! Scans a host network once, wraps every adaptable sublayer inside a target
//! container and indexes the shared [`AdapterHandle`]s by a stable name that
//! LoRA and hypernetwork checkpoints use to address them.
//!
//! Names are derived from the container's dotted path and the leaf's path
//! relative to it:
//!
//! ```text
//! container  down_blocks.0.attentions.1
//! leaf       transformer_blocks.0.attn1.to_q
//! name       unet_down_blocks_0_attentions_1_transformer_blocks_0_attn1_to_q
//! ```

use std::collections::BTreeMap;

use burn::prelude::*;

use crate::adapter::{AdaptableConv, AdaptableLinear, AdapterHandle};
use crate::error::ConfigError;

/// `"{prefix}.{container}.{leaf}"` with every `.` replaced by `_`
pub fn derive_adapter_name(container: &str, leaf: &str, prefix: &str) -> String {
    format!("{prefix}.{container}.{leaf}").replace('.', "_")
}

/// Which containers of a host are scanned and how their names are prefixed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPolicy {
    pub prefix: &'static str,
    pub containers: &'static [&'static str],
}

impl TargetPolicy {
    pub const TEXT_ENCODER: Self = Self {
        prefix: "te",
        containers: &["CLIPAttention", "CLIPMLP"],
    };

    pub const DENOISER: Self = Self {
        prefix: "unet",
        containers: &["Transformer2DModel", "Attention"],
    };

    /// Policy for a host type name
    pub fn for_host(host_type: &str) -> Result<Self, ConfigError> {
        if host_type.contains("CLIP") {
            Ok(Self::TEXT_ENCODER)
        } else if host_type.contains("UNET") {
            Ok(Self::DENOISER)
        } else {
            Err(ConfigError::InvalidTarget(host_type.to_string()))
        }
    }

    fn matches(&self, class: &str) -> bool {
        self.containers.iter().any(|container| *container == class)
    }
}

/// A network whose adaptable sublayers can be scanned
///
/// Implementations report their module tree through the visitor: every child
/// module between [`SiteVisitor::enter`] and [`SiteVisitor::exit`], every
/// adaptable leaf through [`SiteVisitor::linear`] or [`SiteVisitor::conv`].
pub trait AdapterHost<B: Backend> {
    /// Class name of the host (`"UNET"`, `"CLIPTextModel"`, ...)
    fn host_type(&self) -> &str;

    fn visit_sites(&mut self, visitor: &mut SiteVisitor<B>);
}

/// Walks a host's module tree and wraps sublayers inside target containers
pub struct SiteVisitor<B: Backend> {
    policy: TargetPolicy,
    path: Vec<String>,
    /// Depth and dotted path of the outermost matching container
    container: Option<(usize, String)>,
    entries: BTreeMap<String, AdapterHandle<B>>,
}

impl<B: Backend> SiteVisitor<B> {
    fn new(policy: TargetPolicy) -> Self {
        Self {
            policy,
            path: Vec::new(),
            container: None,
            entries: BTreeMap::new(),
        }
    }

    /// Enters child module `name` of class `class`
    pub fn enter(&mut self, name: &str, class: &str) {
        self.path.push(name.to_string());
        if self.container.is_none() && self.policy.matches(class) {
            self.container = Some((self.path.len(), self.path.join(".")));
        }
    }

    /// Leaves the module entered last
    pub fn exit(&mut self) {
        if matches!(self.container, Some((depth, _)) if depth == self.path.len()) {
            self.container = None;
        }
        self.path.pop();
    }

    /// Adapter name for leaf `name` at the current position, if inside a container
    fn site_name(&self, name: &str) -> Option<String> {
        let (depth, container) = self.container.as_ref()?;
        let mut leaf = self.path[*depth..].to_vec();
        leaf.push(name.to_string());
        Some(derive_adapter_name(container, &leaf.join("."), self.policy.prefix))
    }

    fn index(&mut self, name: String, handle: AdapterHandle<B>) {
        if let Some(existing) = self.entries.get(&name) {
            if !existing.same_as(&handle) {
                tracing::warn!(name = %name, "duplicate adapter name, keeping the first slot");
            }
            return;
        }
        self.entries.insert(name, handle);
    }

    pub fn linear(&mut self, name: &str, layer: &mut AdaptableLinear<B>) {
        if let Some(site) = self.site_name(name) {
            let handle = layer.adapter_or_insert(&site);
            self.index(site, handle);
        }
    }

    /// Only 1x1 convolutions are wrapped
    pub fn conv(&mut self, name: &str, layer: &mut AdaptableConv<B>) {
        if layer.kernel_size() != [1, 1] {
            return;
        }
        if let Some(site) = self.site_name(name) {
            let handle = layer.adapter_or_insert(&site);
            self.index(site, handle);
        }
    }
}

/// Index of the adapter slots of one host network
#[derive(Debug)]
pub struct AdapterRegistry<B: Backend> {
    host_type: String,
    policy: TargetPolicy,
    entries: BTreeMap<String, AdapterHandle<B>>,
}

impl<B: Backend> AdapterRegistry<B> {
    /// Scans `host`, wrapping its target sublayers
    ///
    /// Fails with [`ConfigError::InvalidTarget`] for hosts that are neither a
    /// text encoder nor a denoising network. Scanning an already scanned
    /// host reuses the existing slots.
    pub fn new<H: AdapterHost<B> + ?Sized>(host: &mut H) -> Result<Self, ConfigError> {
        let host_type = host.host_type().to_string();
        let policy = TargetPolicy::for_host(&host_type)?;

        let mut visitor = SiteVisitor::new(policy);
        host.visit_sites(&mut visitor);

        tracing::debug!(host = %host_type, prefix = policy.prefix, slots = visitor.entries.len(), "scanned adapter slots");
        Ok(Self {
            host_type,
            policy,
            entries: visitor.entries,
        })
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    pub fn prefix(&self) -> &'static str {
        self.policy.prefix
    }

    pub fn get(&self, name: &str) -> Option<&AdapterHandle<B>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Slot names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AdapterHandle<B>)> {
        self.entries.iter().map(|(name, handle)| (name.as_str(), handle))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Detaches every adapter from every slot
    pub fn clear(&self) {
        for handle in self.entries.values() {
            handle.clear();
        }
    }
}

/// A constructed network together with its adapter registry
#[derive(Debug)]
pub struct Adapted<N, B: Backend> {
    pub network: N,
    pub adapters: AdapterRegistry<B>,
}

impl<N, B: Backend> Adapted<N, B> {
    /// Scans `network` and pairs it with the resulting registry
    pub fn new(mut network: N) -> Result<Self, ConfigError>
    where
        N: AdapterHost<B>,
    {
        let adapters = AdapterRegistry::new(&mut network)?;
        Ok(Self { network, adapters })
    }

    pub fn into_parts(self) -> (N, AdapterRegistry<B>) {
        (self.network, self.adapters)
    }
}
