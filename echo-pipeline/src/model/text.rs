//! Collaborative text backed by a yrs document.
//!
//! Mutations are yrs v1 updates; the snapshot is the full document state
//! encoded as a single update against an empty state vector.

use std::any::Any;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use super::{downcast, Model, ModelCodec, ModelError};

pub const TEXT_MODEL: &str = "echo:model/text";
const TEXT_ROOT: &str = "content";

pub struct TextModel {
    doc: Doc,
    text: TextRef,
}

impl Default for TextModel {
    fn default() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_ROOT);
        Self { doc, text }
    }
}

impl TextModel {
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Insert locally and return the update to publish as a mutation.
    pub fn insert(&mut self, index: u32, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Remove locally and return the update to publish as a mutation.
    pub fn remove(&mut self, index: u32, len: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.text.remove_range(&mut txn, index, len);
        txn.encode_update_v1()
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn apply_update(&mut self, bytes: &[u8]) -> Result<(), String> {
        let update = Update::decode_v1(bytes).map_err(|e| e.to_string())?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| e.to_string())
    }
}

impl Model for TextModel {
    fn model_type(&self) -> &str {
        TEXT_MODEL
    }

    fn apply(&mut self, mutation: &[u8]) -> Result<(), ModelError> {
        self.apply_update(mutation)
            .map_err(|reason| ModelError::InvalidMutation {
                model_type: TEXT_MODEL.into(),
                reason,
            })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct TextCodec;

impl ModelCodec for TextCodec {
    fn model_type(&self) -> &str {
        TEXT_MODEL
    }

    fn create(&self) -> Box<dyn Model> {
        Box::<TextModel>::default()
    }

    fn encode(&self, model: &dyn Model) -> Result<Option<Vec<u8>>, ModelError> {
        Ok(Some(downcast::<TextModel>(model, TEXT_MODEL)?.encode_state()))
    }

    fn decode(&self, snapshot: &[u8]) -> Result<Box<dyn Model>, ModelError> {
        let mut model = TextModel::default();
        model
            .apply_update(snapshot)
            .map_err(|reason| ModelError::Codec {
                model_type: TEXT_MODEL.into(),
                reason,
            })?;
        Ok(Box::new(model))
    }
}
