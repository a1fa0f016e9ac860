//! Key/value object model with JSON property values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;

use super::{downcast, Model, ModelCodec, ModelError};

pub const OBJECT_MODEL: &str = "echo:model/object";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ObjectMutation {
    Set { key: String, value: Value },
    Delete { key: String },
}

impl ObjectMutation {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        ObjectMutation::Set {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        ObjectMutation::Delete { key: key.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::InvalidMutation {
            model_type: OBJECT_MODEL.into(),
            reason: e.to_string(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        serde_json::from_slice(bytes).map_err(|e| ModelError::InvalidMutation {
            model_type: OBJECT_MODEL.into(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectModel {
    properties: BTreeMap<String, Value>,
}

impl ObjectModel {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }
}

impl Model for ObjectModel {
    fn model_type(&self) -> &str {
        OBJECT_MODEL
    }

    fn apply(&mut self, mutation: &[u8]) -> Result<(), ModelError> {
        match ObjectMutation::decode(mutation)? {
            ObjectMutation::Set { key, value } => {
                self.properties.insert(key, value);
            }
            ObjectMutation::Delete { key } => {
                self.properties.remove(&key);
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ObjectCodec;

impl ModelCodec for ObjectCodec {
    fn model_type(&self) -> &str {
        OBJECT_MODEL
    }

    fn create(&self) -> Box<dyn Model> {
        Box::<ObjectModel>::default()
    }

    fn encode(&self, model: &dyn Model) -> Result<Option<Vec<u8>>, ModelError> {
        let object = downcast::<ObjectModel>(model, OBJECT_MODEL)?;
        serde_json::to_vec(&object.properties)
            .map(Some)
            .map_err(|e| ModelError::Codec {
                model_type: OBJECT_MODEL.into(),
                reason: e.to_string(),
            })
    }

    fn decode(&self, snapshot: &[u8]) -> Result<Box<dyn Model>, ModelError> {
        let properties = serde_json::from_slice(snapshot).map_err(|e| ModelError::Codec {
            model_type: OBJECT_MODEL.into(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(ObjectModel { properties }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_delete() {
        let mut model = ObjectModel::default();
        model
            .apply(&ObjectMutation::set("title", json!("draft")).encode().unwrap())
            .unwrap();
        model
            .apply(&ObjectMutation::set("count", json!(3)).encode().unwrap())
            .unwrap();
        model.apply(&ObjectMutation::delete("count").encode().unwrap()).unwrap();

        assert_eq!(model.get("title"), Some(&json!("draft")));
        assert!(model.get("count").is_none());
    }

    #[test]
    fn test_snapshot_holds_latest_value() {
        let mut model = ObjectModel::default();
        model
            .apply(&ObjectMutation::set("title", json!("v1")).encode().unwrap())
            .unwrap();
        model
            .apply(&ObjectMutation::set("title", json!("v2")).encode().unwrap())
            .unwrap();

        let payload = ObjectCodec.encode(&model).unwrap().unwrap();
        let restored = ObjectCodec.decode(&payload).unwrap();
        let restored = downcast::<ObjectModel>(restored.as_ref(), OBJECT_MODEL).unwrap();
        assert_eq!(restored.get("title"), Some(&json!("v2")));
        assert_eq!(restored.properties().len(), 1);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut model = ObjectModel::default();
        assert!(matches!(
            model.apply(b"\x00\x01"),
            Err(ModelError::InvalidMutation { .. })
        ));
        assert!(ObjectCodec.decode(b"[1,2]").is_err());
    }

    #[test]
    fn test_mutation_wire_shape() {
        let bytes = ObjectMutation::delete("k").encode().unwrap();
        assert_eq!(bytes, br#"{"op":"delete","key":"k"}"#);
    }
}
