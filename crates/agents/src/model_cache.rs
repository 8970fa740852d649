//! Process-wide cache of the most recently loaded model.
//!
//! Holds a single entry keyed by `(model_id, adapter_path)`. Requesting a
//! different key loads the new model and replaces the entry; whoever still
//! holds an `Arc` to the previous model keeps using it until they drop it.

use std::{fmt, future::Future, sync::Arc};

use {tokio::sync::RwLock, tracing::info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model_id: String,
    pub adapter_path: Option<String>,
}

impl ModelKey {
    pub fn new(model_id: impl Into<String>, adapter_path: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            adapter_path,
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.adapter_path {
            Some(adapter) => write!(f, "{} (adapter {adapter})", self.model_id),
            None => f.write_str(&self.model_id),
        }
    }
}

/// Last-used-model cache. Last writer wins.
pub struct ModelCache<M: ?Sized> {
    entry: RwLock<Option<(ModelKey, Arc<M>)>>,
}

impl<M: ?Sized> Default for ModelCache<M> {
    fn default() -> Self {
        Self {
            entry: RwLock::new(None),
        }
    }
}

impl<M: ?Sized> ModelCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached model if its key matches.
    pub async fn get(&self, key: &ModelKey) -> Option<Arc<M>> {
        let guard = self.entry.read().await;
        match guard.as_ref() {
            Some((cached, model)) if cached == key => Some(Arc::clone(model)),
            _ => None,
        }
    }

    pub async fn current_key(&self) -> Option<ModelKey> {
        self.entry.read().await.as_ref().map(|(key, _)| key.clone())
    }

    /// Return the cached model for `key`, or run `load` and cache its result.
    ///
    /// The loader runs without holding the lock, so concurrent misses may
    /// each load; the last one to finish owns the entry. A failed load leaves
    /// the previous entry in place.
    pub async fn get_or_load<F, Fut, E>(&self, key: ModelKey, load: F) -> Result<Arc<M>, E>
    where
        F: FnOnce(ModelKey) -> Fut,
        Fut: Future<Output = Result<Arc<M>, E>>,
    {
        if let Some(model) = self.get(&key).await {
            return Ok(model);
        }

        info!(model = %key, "loading model");
        let model = load(key.clone()).await?;
        *self.entry.write().await = Some((key, Arc::clone(&model)));
        Ok(model)
    }

    /// Drop the cached entry. Outstanding `Arc`s stay valid.
    pub async fn clear(&self) {
        self.entry.write().await.take();
    }
}
