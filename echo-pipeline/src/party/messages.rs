//! Messages carried by party feeds.

use echo_util::Timeframe;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::{FeedBlock, MessageSelector};
use crate::snapshot::ItemId;

#[derive(Debug, Error)]
#[error("Feed message codec error: {0}")]
pub struct MessageCodecError(String);

/// One feed block. `timeframe` is what the writer had processed when it
/// wrote the message; readers hold the message back until they caught up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub timeframe: Timeframe,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Credential message, kept verbatim.
    Halo(Vec<u8>),
    Echo(EchoEnvelope),
}

/// Item creation and/or mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoEnvelope {
    pub item_id: ItemId,
    pub genesis: Option<ItemGenesis>,
    pub mutation: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemGenesis {
    pub item_type: Option<String>,
    pub model_type: String,
    pub parent_id: Option<ItemId>,
}

impl EchoEnvelope {
    pub fn genesis(
        item_id: impl Into<ItemId>,
        model_type: impl Into<String>,
        item_type: Option<String>,
        parent_id: Option<ItemId>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            genesis: Some(ItemGenesis {
                item_type,
                model_type: model_type.into(),
                parent_id,
            }),
            mutation: None,
        }
    }

    pub fn mutation(item_id: impl Into<ItemId>, mutation: Vec<u8>) -> Self {
        Self {
            item_id: item_id.into(),
            genesis: None,
            mutation: Some(mutation),
        }
    }

    pub fn with_mutation(mut self, mutation: Vec<u8>) -> Self {
        self.mutation = Some(mutation);
        self
    }
}

impl FeedMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageCodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| MessageCodecError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageCodecError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(message, _)| message)
            .map_err(|e| MessageCodecError(e.to_string()))
    }
}

/// Picks the first head whose declared timeframe is already processed.
/// Undecodable heads count as ready so the pipeline can drop them.
pub fn dependency_selector() -> impl MessageSelector {
    |candidates: &[FeedBlock], current: &Timeframe| {
        candidates
            .iter()
            .position(|block| match FeedMessage::decode(&block.data) {
                Ok(message) => current.dependencies_satisfied(&message.timeframe),
                Err(_) => true,
            })
    }
}
