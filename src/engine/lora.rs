//! LoRA adapter store.
//!
//! Adapters are registered and removed by id while the engine runs. The
//! executor resolves each stream's adapter id once per round and hands the
//! weights to the compute backend alongside the row.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::RwLock;
use tracing::info;

use crate::error::{Error, Result};

/// Adapter identifier chosen by the caller.
pub type AdapterId = u64;

/// A named set of adapter weight tensors.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    id: AdapterId,
    name: String,
    tensors: HashMap<String, Tensor>,
}

impl LoraAdapter {
    /// Wrap already-loaded tensors.
    pub fn new(id: AdapterId, name: impl Into<String>, tensors: HashMap<String, Tensor>) -> Self {
        Self {
            id,
            name: name.into(),
            tensors,
        }
    }

    /// Load adapter weights from a safetensors file.
    pub fn from_safetensors(id: AdapterId, path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("lora-{id}"));
        Ok(Self::new(id, name, tensors))
    }

    /// Adapter id.
    pub fn id(&self) -> AdapterId {
        self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up one weight tensor.
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Number of weight tensors.
    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }
}

/// Thread-safe registry of loaded adapters.
#[derive(Debug, Default)]
pub struct LoraRegistry {
    adapters: RwLock<HashMap<AdapterId, Arc<LoraAdapter>>>,
}

impl LoraRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any adapter with the same id.
    pub fn add(&self, adapter: LoraAdapter) -> Option<Arc<LoraAdapter>> {
        info!(lora_id = adapter.id(), name = adapter.name(), "adding LoRA adapter");
        self.adapters.write().insert(adapter.id(), Arc::new(adapter))
    }

    /// Unregister an adapter. Rows already built keep their reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterNotFound`] if the id is unknown.
    pub fn remove(&self, id: AdapterId) -> Result<Arc<LoraAdapter>> {
        let removed = self
            .adapters
            .write()
            .remove(&id)
            .ok_or(Error::AdapterNotFound(id))?;
        info!(lora_id = id, "removed LoRA adapter");
        Ok(removed)
    }

    /// Resolve an adapter id.
    pub fn get(&self, id: AdapterId) -> Option<Arc<LoraAdapter>> {
        self.adapters.read().get(&id).cloned()
    }

    /// Whether `id` is loaded.
    pub fn contains(&self, id: AdapterId) -> bool {
        self.adapters.read().contains_key(&id)
    }

    /// Number of loaded adapters.
    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    /// Whether no adapter is loaded.
    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}
