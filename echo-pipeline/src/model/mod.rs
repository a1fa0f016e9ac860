//! Item models and the codec registry.
//!
//! Every item carries one model. Models change only through opaque mutation
//! bytes read from feeds. A [`ModelCodec`] knows how to create a model of its
//! type and, when the model supports it, how to snapshot and restore it.
//! Models whose codec cannot snapshot are captured by their mutation history
//! instead (see `snapshot`).

pub mod object;
pub mod text;

use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

pub use object::{ObjectCodec, ObjectModel, ObjectMutation};
pub use text::{TextCodec, TextModel};

pub type ModelType = String;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unknown model type: {0}")]
    UnknownModel(String),
    #[error("Invalid mutation for {model_type}: {reason}")]
    InvalidMutation { model_type: String, reason: String },
    #[error("Snapshot codec error for {model_type}: {reason}")]
    Codec { model_type: String, reason: String },
    #[error("Model type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

pub trait Model: Send + Sync {
    fn model_type(&self) -> &str;

    /// Apply one mutation read from a feed.
    fn apply(&mut self, mutation: &[u8]) -> Result<(), ModelError>;

    fn as_any(&self) -> &dyn Any;
}

pub trait ModelCodec: Send + Sync {
    fn model_type(&self) -> &str;

    /// Fresh, empty model.
    fn create(&self) -> Box<dyn Model>;

    /// Snapshot payload of `model`. `Ok(None)` if this type has no snapshot
    /// form.
    fn encode(&self, model: &dyn Model) -> Result<Option<Vec<u8>>, ModelError>;

    /// Rebuild a model from a payload produced by `encode`.
    fn decode(&self, snapshot: &[u8]) -> Result<Box<dyn Model>, ModelError>;
}

/// Downcast helper shared by codecs.
pub(crate) fn downcast<'a, M: 'static>(
    model: &'a dyn Model,
    expected: &str,
) -> Result<&'a M, ModelError> {
    model
        .as_any()
        .downcast_ref::<M>()
        .ok_or_else(|| ModelError::TypeMismatch {
            expected: expected.to_string(),
            actual: model.model_type().to_string(),
        })
}

#[derive(Clone, Default)]
pub struct ModelRegistry {
    codecs: FxHashMap<ModelType, Arc<dyn ModelCodec>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`ObjectModel`] and [`TextModel`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ObjectCodec));
        registry.register(Arc::new(TextCodec));
        registry
    }

    /// Register (or replace) the codec of its model type.
    pub fn register(&mut self, codec: Arc<dyn ModelCodec>) {
        self.codecs.insert(codec.model_type().to_string(), codec);
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.codecs.contains_key(model_type)
    }

    pub fn get(&self, model_type: &str) -> Result<Arc<dyn ModelCodec>, ModelError> {
        self.codecs
            .get(model_type)
            .cloned()
            .ok_or_else(|| ModelError::UnknownModel(model_type.to_string()))
    }

    pub fn create(&self, model_type: &str) -> Result<Box<dyn Model>, ModelError> {
        Ok(self.get(model_type)?.create())
    }

    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
