//! Live item state of a party and its snapshot conversion.

use echo_util::{PublicKey, Timeframe};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::{
    DatabaseSnapshot, HaloStateSnapshot, ItemSnapshot, ModelSnapshot, PartySnapshot,
    SnapshotError, SNAPSHOT_VERSION,
};
use crate::model::{Model, ModelError, ModelRegistry};

pub type ItemId = String;

/// Errors applying live feed messages to the item state.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("Item already exists: {0}")]
    DuplicateItem(ItemId),
    #[error("Unknown item: {0}")]
    UnknownItem(ItemId),
    #[error("Item {item} references missing parent {parent}")]
    MissingParent { item: ItemId, parent: ItemId },
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

pub struct Item {
    id: ItemId,
    item_type: Option<String>,
    model_type: String,
    parent_id: Option<ItemId>,
    model: Box<dyn Model>,
    /// Applied mutations. Only models without a snapshot form keep them.
    history: Option<Vec<Vec<u8>>>,
}

impl Item {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn item_type(&self) -> Option<&str> {
        self.item_type.as_deref()
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    /// Typed view of the model.
    pub fn model_as<M: 'static>(&self) -> Option<&M> {
        self.model.as_any().downcast_ref::<M>()
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("model_type", &self.model_type)
            .field("parent_id", &self.parent_id)
            .finish()
    }
}

/// Items in creation order. Parents are always created before children.
#[derive(Default)]
struct ItemManager {
    items: BTreeMap<ItemId, Item>,
    order: Vec<ItemId>,
}

impl ItemManager {
    fn insert(&mut self, item: Item) {
        self.order.push(item.id.clone());
        self.items.insert(item.id.clone(), item);
    }

    fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    fn in_order(&self) -> impl Iterator<Item = &Item> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }
}

/// Replicated state of one party: items, halo messages and the processed
/// timeframe.
pub struct PartyState {
    party_key: Option<PublicKey>,
    registry: Arc<ModelRegistry>,
    items: ItemManager,
    halo_messages: Vec<Vec<u8>>,
    timeframe: Timeframe,
}

impl PartyState {
    pub fn new(party_key: Option<PublicKey>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            party_key,
            registry,
            items: ItemManager::default(),
            halo_messages: Vec::new(),
            timeframe: Timeframe::new(),
        }
    }

    pub fn party_key(&self) -> Option<PublicKey> {
        self.party_key
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn create_item(
        &mut self,
        id: ItemId,
        item_type: Option<String>,
        model_type: &str,
        parent_id: Option<ItemId>,
    ) -> Result<(), ItemError> {
        if self.items.contains(&id) {
            return Err(ItemError::DuplicateItem(id));
        }
        if let Some(parent) = &parent_id {
            if !self.items.contains(parent) {
                return Err(ItemError::MissingParent {
                    item: id,
                    parent: parent.clone(),
                });
            }
        }
        let codec = self.registry.get(model_type)?;
        let model = codec.create();
        let history = codec.encode(model.as_ref())?.is_none().then(Vec::new);
        self.items.insert(Item {
            id,
            item_type,
            model_type: model_type.to_string(),
            parent_id,
            model,
            history,
        });
        Ok(())
    }

    pub fn mutate_item(&mut self, id: &str, mutation: &[u8]) -> Result<(), ItemError> {
        let item = self
            .items
            .items
            .get_mut(id)
            .ok_or_else(|| ItemError::UnknownItem(id.to_string()))?;
        item.model.apply(mutation)?;
        if let Some(history) = &mut item.history {
            history.push(mutation.to_vec());
        }
        Ok(())
    }

    pub fn add_halo_message(&mut self, message: Vec<u8>) {
        self.halo_messages.push(message);
    }

    /// Record `seq` of `feed_key` as processed.
    pub fn advance(&mut self, feed_key: PublicKey, seq: u64) -> bool {
        self.timeframe.set(feed_key, seq)
    }

    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    pub fn item(&self, id: &str) -> Option<&Item> {
        self.items.items.get(id)
    }

    /// Items in creation order.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.in_order()
    }

    pub fn children<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Item> + 'a {
        self.items
            .in_order()
            .filter(move |item| item.parent_id.as_deref() == Some(parent))
    }

    pub fn item_count(&self) -> usize {
        self.items.items.len()
    }

    pub fn halo_messages(&self) -> &[Vec<u8>] {
        &self.halo_messages
    }

    /// Capture the current state. Fails as a whole if any model fails to
    /// encode.
    pub fn create_snapshot(&self) -> Result<PartySnapshot, SnapshotError> {
        let mut items = Vec::with_capacity(self.item_count());
        for item in self.items.in_order() {
            let codec = self
                .registry
                .get(&item.model_type)
                .map_err(|_| SnapshotError::UnknownModel(item.model_type.clone()))?;
            let custom = codec.encode(item.model.as_ref())?;
            let mutations = match (&custom, &item.history) {
                (None, Some(history)) => history.clone(),
                _ => Vec::new(),
            };
            items.push(ItemSnapshot {
                item_id: item.id.clone(),
                item_type: item.item_type.clone(),
                model_type: item.model_type.clone(),
                parent_id: item.parent_id.clone(),
                model: ModelSnapshot { custom, mutations },
            });
        }

        Ok(PartySnapshot {
            version: SNAPSHOT_VERSION,
            party_key: self.party_key,
            timeframe: self.timeframe.clone(),
            database: DatabaseSnapshot { items },
            halo: HaloStateSnapshot {
                messages: self.halo_messages.clone(),
            },
        })
    }

    /// Replace the state with `snapshot`. Nothing changes unless every item
    /// restores.
    pub fn restore_from_snapshot(&mut self, snapshot: &PartySnapshot) -> Result<(), SnapshotError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }

        let mut restored = ItemManager::default();
        for record in &snapshot.database.items {
            if restored.contains(&record.item_id) {
                return Err(SnapshotError::DuplicateItem(record.item_id.clone()));
            }
            if let Some(parent) = &record.parent_id {
                if !restored.contains(parent) {
                    return Err(SnapshotError::MissingParent {
                        item: record.item_id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
            let codec = self
                .registry
                .get(&record.model_type)
                .map_err(|_| SnapshotError::UnknownModel(record.model_type.clone()))?;

            let (model, history) = match &record.model.custom {
                Some(custom) => (codec.decode(custom)?, None),
                None => {
                    let mut model = codec.create();
                    for mutation in &record.model.mutations {
                        model.apply(mutation)?;
                    }
                    (model, Some(record.model.mutations.clone()))
                }
            };

            restored.insert(Item {
                id: record.item_id.clone(),
                item_type: record.item_type.clone(),
                model_type: record.model_type.clone(),
                parent_id: record.parent_id.clone(),
                model,
                history,
            });
        }

        self.items = restored;
        self.halo_messages = snapshot.halo.messages.clone();
        self.timeframe = snapshot.timeframe.clone();
        if snapshot.party_key.is_some() {
            self.party_key = snapshot.party_key;
        }
        log::info!(
            "Restored party state: {} items, {} halo messages at {}",
            self.item_count(),
            self.halo_messages.len(),
            self.timeframe
        );
        Ok(())
    }
}
