//! Message metadata and the in-memory [`MessageStore`] implementation.
//!
//! [`MemoryMessageStore`] is suitable for tests and tooling; the production
//! node uses RocksDB (braid-node). Both follow the same solidity rules:
//!
//! - solid entry points (the zero identity at minimum) are solid by definition
//! - a message is solid when every parent is known and solid
//! - when a message becomes solid, stored children whose parents are now all
//!   solid become solid too, transitively
//! - an unconfirmed message's root index is the minimum of its known
//!   parents' root indexes; confirming a message re-derives it for every
//!   stored descendant

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;

use crate::error::BraidError;
use crate::traits::MessageStore;
use crate::types::{Message, MessageId};

/// Per-identity bookkeeping kept next to the message bytes.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct MessageMetadata {
    /// Whether the full ancestry is present and solid.
    pub solid: bool,
    /// Confirmation index of the oldest confirmed root referenced.
    pub root_index: u32,
    /// Confirmation index at which this message was confirmed, if any.
    pub confirmed_at: Option<u32>,
}

impl MessageMetadata {
    /// Metadata of a solid entry point confirmed at `index`.
    pub fn entry_point(index: u32) -> Self {
        Self {
            solid: true,
            root_index: index,
            confirmed_at: Some(index),
        }
    }

    /// Metadata for a newly stored message given its parents' metadata.
    ///
    /// `None` entries are parents that are not in storage. The root index is
    /// the minimum over known parents, or `confirmed_index` if none is known.
    pub fn for_new(parents: &[Option<MessageMetadata>], confirmed_index: u32) -> Self {
        let solid = parents.iter().all(|p| p.as_ref().is_some_and(|m| m.solid));
        let root_index = parents
            .iter()
            .flatten()
            .map(|m| m.root_index)
            .min()
            .unwrap_or(confirmed_index);
        Self {
            solid,
            root_index,
            confirmed_at: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageId, Message>,
    metadata: HashMap<MessageId, MessageMetadata>,
    entry_points: HashSet<MessageId>,
    /// parent → stored children referencing it.
    children: HashMap<MessageId, Vec<MessageId>>,
    confirmed_index: u32,
    writes: usize,
}

impl Inner {
    fn is_solid(&self, id: &MessageId) -> bool {
        self.metadata.get(id).is_some_and(|m| m.solid)
    }

    /// Mark solid every stored descendant of `start` whose parents are all solid.
    fn propagate_solidity(&mut self, start: MessageId) -> usize {
        let mut queue = VecDeque::from([start]);
        let mut marked = 0;
        while let Some(parent) = queue.pop_front() {
            let Some(children) = self.children.get(&parent).cloned() else {
                continue;
            };
            for child in children {
                if self.is_solid(&child) {
                    continue;
                }
                let ready = self
                    .messages
                    .get(&child)
                    .is_some_and(|m| m.parents().iter().all(|p| self.is_solid(p)));
                if ready {
                    if let Some(meta) = self.metadata.get_mut(&child) {
                        meta.solid = true;
                        marked += 1;
                        queue.push_back(child);
                    }
                }
            }
        }
        marked
    }

    /// Re-derive the root index of every unconfirmed stored descendant of
    /// `start`, stopping where nothing changes.
    fn propagate_root_index(&mut self, start: MessageId) -> usize {
        let mut queue = VecDeque::from([start]);
        let mut updated = 0;
        while let Some(parent) = queue.pop_front() {
            let Some(children) = self.children.get(&parent).cloned() else {
                continue;
            };
            for child in children {
                let Some(message) = self.messages.get(&child) else {
                    continue;
                };
                let root = message
                    .parents()
                    .iter()
                    .filter_map(|p| self.metadata.get(p).map(|m| m.root_index))
                    .min();
                let Some(root) = root else {
                    continue;
                };
                let Some(meta) = self.metadata.get_mut(&child) else {
                    continue;
                };
                if meta.confirmed_at.is_some() || meta.root_index == root {
                    continue;
                }
                meta.root_index = root;
                updated += 1;
                queue.push_back(child);
            }
        }
        updated
    }
}

/// In-memory message storage for testing.
///
/// Stores everything in `HashMap`s behind a `RwLock`, with no persistence.
pub struct MemoryMessageStore {
    inner: RwLock<Inner>,
}

impl MemoryMessageStore {
    /// Create a store holding only the genesis solid entry point.
    pub fn new() -> Self {
        let store = Self {
            inner: RwLock::new(Inner::default()),
        };
        store.add_solid_entry_point(MessageId::ZERO, 0);
        store
    }

    /// Register an identity as solid without its message.
    pub fn add_solid_entry_point(&self, id: MessageId, index: u32) {
        let mut inner = self.inner.write();
        inner.entry_points.insert(id);
        inner.metadata.insert(id, MessageMetadata::entry_point(index));
        inner.propagate_solidity(id);
    }

    /// Confirm `id` at `index` and advance the confirmed reference point.
    ///
    /// Stored descendants of `id` have their root index re-derived. Returns
    /// `false` if the identity is unknown; the reference point still
    /// advances.
    pub fn confirm(&self, id: &MessageId, index: u32) -> bool {
        let mut inner = self.inner.write();
        inner.confirmed_index = inner.confirmed_index.max(index);
        match inner.metadata.get_mut(id) {
            Some(meta) => {
                meta.confirmed_at = Some(index);
                meta.root_index = index;
                inner.propagate_root_index(*id);
                true
            }
            None => false,
        }
    }

    /// Number of message writes performed (duplicates excluded).
    pub fn write_count(&self) -> usize {
        self.inner.read().writes
    }

    /// Number of stored messages (entry points excluded).
    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    /// Whether no messages are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.read().messages.is_empty()
    }

    /// Metadata of a known identity.
    pub fn metadata(&self, id: &MessageId) -> Option<MessageMetadata> {
        self.inner.read().metadata.get(id).cloned()
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn contains(&self, id: &MessageId) -> Result<bool, BraidError> {
        let inner = self.inner.read();
        Ok(inner.messages.contains_key(id) || inner.entry_points.contains(id))
    }

    fn get(&self, id: &MessageId) -> Result<Option<Message>, BraidError> {
        Ok(self.inner.read().messages.get(id).cloned())
    }

    fn put(&self, message: &Message) -> Result<bool, BraidError> {
        let id = message.id();
        let mut inner = self.inner.write();
        if inner.messages.contains_key(&id) || inner.entry_points.contains(&id) {
            return Ok(false);
        }

        let parents: Vec<Option<MessageMetadata>> = message
            .parents()
            .iter()
            .map(|p| inner.metadata.get(p).cloned())
            .collect();
        let meta = MessageMetadata::for_new(&parents, inner.confirmed_index);
        let solid = meta.solid;

        for parent in message.parents() {
            inner.children.entry(*parent).or_default().push(id);
        }
        inner.metadata.insert(id, meta);
        inner.messages.insert(id, message.clone());
        inner.writes += 1;

        if solid {
            inner.propagate_solidity(id);
        }
        Ok(true)
    }

    fn is_solid(&self, id: &MessageId) -> Result<bool, BraidError> {
        Ok(self.inner.read().is_solid(id))
    }

    fn confirmed_index(&self) -> Result<u32, BraidError> {
        Ok(self.inner.read().confirmed_index)
    }

    fn root_index(&self, id: &MessageId) -> Result<Option<u32>, BraidError> {
        Ok(self.inner.read().metadata.get(id).map(|m| m.root_index))
    }
}
