//! RocksDB-backed persistent message storage.
//!
//! Implements [`MessageStore`] using column families for message bytes,
//! per-message metadata, a parent → child index, and scalar metadata. Every
//! write is an atomic [`WriteBatch`], so a message, its metadata, its child
//! index entries, and any solidity it unlocks land together.
//!
//! On first open, the zero identity is registered as the genesis solid entry
//! point.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, DB, Options, SliceTransform, WriteBatch};

use braid_core::error::BraidError;
use braid_core::storage::MessageMetadata;
use braid_core::traits::MessageStore;
use braid_core::types::{Message, MessageId};

// --- Column family names ---

const CF_MESSAGES: &str = "messages";
const CF_METADATA: &str = "metadata";
const CF_CHILDREN: &str = "children";
const CF_META: &str = "meta";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_MESSAGES, CF_METADATA, CF_CHILDREN, CF_META];

// --- Scalar metadata keys ---

const META_CONFIRMED_INDEX: &[u8] = b"confirmed_index";
const META_MESSAGE_COUNT: &[u8] = b"message_count";

/// Length of an identity; the child index key is `parent ‖ child`.
const ID_LEN: usize = 32;

fn storage_err(e: impl std::fmt::Display) -> BraidError {
    BraidError::Storage(e.to_string())
}

fn decode_u64(bytes: &[u8]) -> Result<u64, BraidError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BraidError::Storage("invalid metadata value length".into()))?;
    Ok(u64::from_le_bytes(raw))
}

fn child_key(parent: &MessageId, child: &MessageId) -> [u8; 2 * ID_LEN] {
    let mut key = [0u8; 2 * ID_LEN];
    key[..ID_LEN].copy_from_slice(parent.as_bytes());
    key[ID_LEN..].copy_from_slice(child.as_bytes());
    key
}

/// RocksDB-backed persistent message storage.
///
/// Reads go straight to RocksDB. Writes are serialised by an internal lock
/// so solidity propagation always observes a consistent view.
pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist and seeds the genesis
    /// solid entry point on first open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BraidError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Child index keys are grouped by their 32-byte parent prefix.
                if *name == CF_CHILDREN {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(ID_LEN));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(storage_err)?;

        let store = Self {
            db,
            write_lock: Mutex::new(()),
        };

        if store.metadata(&MessageId::ZERO)?.is_none() {
            store.add_solid_entry_point(MessageId::ZERO, 0)?;
        }

        Ok(store)
    }

    /// Metadata of a known identity.
    pub fn metadata(&self, id: &MessageId) -> Result<Option<MessageMetadata>, BraidError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => {
                let (meta, _): (MessageMetadata, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(storage_err)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Register an identity as solid without its message.
    pub fn add_solid_entry_point(&self, id: MessageId, index: u32) -> Result<(), BraidError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut overlay = HashMap::from([(id, MessageMetadata::entry_point(index))]);
        self.propagate_solidity(id, &mut overlay)?;
        self.write_overlay(&mut batch, &overlay)?;
        self.db.write(batch).map_err(storage_err)
    }

    /// Confirm `id` at `index` and advance the confirmed reference point.
    ///
    /// Stored descendants of `id` have their root index re-derived. Returns `false` if the identity is unknown; the reference point still
    /// advances.
    pub fn confirm(&self, id: &MessageId, index: u32) -> Result<bool, BraidError> {
        let _guard = self.write_lock.lock();
        let cf_meta = self.cf_handle(CF_META)?;
        let mut batch = WriteBatch::default();

        let confirmed = self.confirmed_index()?.max(index);
        batch.put_cf(cf_meta, META_CONFIRMED_INDEX, u64::from(confirmed).to_le_bytes());

        let known = match self.metadata(id)? {
            Some(mut meta) => {
                meta.confirmed_at = Some(index);
                meta.root_index = index;
                let mut overlay = HashMap::from([(*id, meta)]);
                self.propagate_root_index(*id, &mut overlay)?;
                self.write_overlay(&mut batch, &overlay)?;
                true
            }
            None => false,
        };

        self.db.write(batch).map_err(storage_err)?;
        Ok(known)
    }

    /// Number of messages written since the database was created.
    pub fn write_count(&self) -> Result<u64, BraidError> {
        self.get_meta_u64(META_MESSAGE_COUNT)
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), BraidError> {
        self.db.flush().map_err(storage_err)
    }

    // --- Internal helpers ---

    /// Metadata as seen through pending, not yet written, updates.
    fn metadata_with(
        &self,
        overlay: &HashMap<MessageId, MessageMetadata>,
        id: &MessageId,
    ) -> Result<Option<MessageMetadata>, BraidError> {
        match overlay.get(id) {
            Some(meta) => Ok(Some(meta.clone())),
            None => self.metadata(id),
        }
    }

    fn is_solid_with(
        &self,
        overlay: &HashMap<MessageId, MessageMetadata>,
        id: &MessageId,
    ) -> Result<bool, BraidError> {
        Ok(self.metadata_with(overlay, id)?.is_some_and(|m| m.solid))
    }

    /// Stored children of `parent`.
    fn children(&self, parent: &MessageId) -> Result<Vec<MessageId>, BraidError> {
        let cf = self.cf_handle(CF_CHILDREN)?;
        let prefix = parent.as_bytes();
        let mut children = Vec::new();

        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, _) = item.map_err(storage_err)?;
            // The prefix iterator may overshoot.
            if key.len() != 2 * ID_LEN || &key[..ID_LEN] != prefix {
                break;
            }
            let mut child = [0u8; ID_LEN];
            child.copy_from_slice(&key[ID_LEN..]);
            children.push(MessageId(child));
        }
        Ok(children)
    }

    /// Mark solid every stored descendant of `start` whose parents are all
    /// solid, recording the updates in `overlay`.
    fn propagate_solidity(
        &self,
        start: MessageId,
        overlay: &mut HashMap<MessageId, MessageMetadata>,
    ) -> Result<(), BraidError> {
        let mut queue = VecDeque::from([start]);
        while let Some(parent) = queue.pop_front() {
            for child in self.children(&parent)? {
                let Some(mut meta) = self.metadata_with(overlay, &child)? else {
                    continue;
                };
                if meta.solid {
                    continue;
                }
                let Some(message) = self.get(&child)? else {
                    continue;
                };
                let mut ready = true;
                for p in message.parents() {
                    if !self.is_solid_with(overlay, p)? {
                        ready = false;
                        break;
                    }
                }
                if ready {
                    meta.solid = true;
                    overlay.insert(child, meta);
                    queue.push_back(child);
                }
            }
        }
        Ok(())
    }

    /// Re-derive the root index of every unconfirmed stored descendant of
    /// `start`, recording the updates in `overlay`.
    fn propagate_root_index(
        &self,
        start: MessageId,
        overlay: &mut HashMap<MessageId, MessageMetadata>,
    ) -> Result<(), BraidError> {
        let mut queue = VecDeque::from([start]);
        while let Some(parent) = queue.pop_front() {
            for child in self.children(&parent)? {
                let Some(mut meta) = self.metadata_with(overlay, &child)? else {
                    continue;
                };
                if meta.confirmed_at.is_some() {
                    continue;
                }
                let Some(message) = self.get(&child)? else {
                    continue;
                };
                let mut roots = Vec::with_capacity(message.parents().len());
                for p in message.parents() {
                    if let Some(parent_meta) = self.metadata_with(overlay, p)? {
                        roots.push(parent_meta.root_index);
                    }
                }
                let Some(root) = roots.into_iter().min() else {
                    continue;
                };
                if root != meta.root_index {
                    meta.root_index = root;
                    overlay.insert(child, meta);
                    queue.push_back(child);
                }
            }
        }
        Ok(())
    }

    fn write_overlay(
        &self,
        batch: &mut WriteBatch,
        overlay: &HashMap<MessageId, MessageMetadata>,
    ) -> Result<(), BraidError> {
        let cf = self.cf_handle(CF_METADATA)?;
        for (id, meta) in overlay {
            let bytes = bincode::encode_to_vec(meta, bincode::config::standard())
                .map_err(storage_err)?;
            batch.put_cf(cf, id.as_bytes(), bytes);
        }
        Ok(())
    }

    /// Get a u64 from the scalar metadata column family.
    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, BraidError> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, key).map_err(storage_err)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, BraidError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| BraidError::Storage(format!("missing column family: {name}")))
    }
}

impl MessageStore for RocksStore {
    fn contains(&self, id: &MessageId) -> Result<bool, BraidError> {
        Ok(self.metadata(id)?.is_some())
    }

    fn get(&self, id: &MessageId) -> Result<Option<Message>, BraidError> {
        let cf = self.cf_handle(CF_MESSAGES)?;
        match self.db.get_cf(cf, id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Message::from_bytes(&bytes).map(Some).map_err(storage_err),
            None => Ok(None),
        }
    }

    fn put(&self, message: &Message) -> Result<bool, BraidError> {
        let id = message.id();
        let _guard = self.write_lock.lock();
        if self.metadata(&id)?.is_some() {
            return Ok(false);
        }

        let mut parents = Vec::with_capacity(message.parents().len());
        for parent in message.parents() {
            parents.push(self.metadata(parent)?);
        }
        let meta = MessageMetadata::for_new(&parents, self.confirmed_index()?);
        let solid = meta.solid;

        let cf_messages = self.cf_handle(CF_MESSAGES)?;
        let cf_children = self.cf_handle(CF_CHILDREN)?;
        let cf_meta = self.cf_handle(CF_META)?;
        let mut batch = WriteBatch::default();

        batch.put_cf(cf_messages, id.as_bytes(), message.bytes());
        for parent in message.parents() {
            batch.put_cf(cf_children, child_key(parent, &id), []);
        }
        let count = self.get_meta_u64(META_MESSAGE_COUNT)? + 1;
        batch.put_cf(cf_meta, META_MESSAGE_COUNT, count.to_le_bytes());

        let mut overlay = HashMap::from([(id, meta)]);
        if solid {
            self.propagate_solidity(id, &mut overlay)?;
        }
        self.write_overlay(&mut batch, &overlay)?;

        self.db.write(batch).map_err(storage_err)?;
        Ok(true)
    }

    fn is_solid(&self, id: &MessageId) -> Result<bool, BraidError> {
        Ok(self.metadata(id)?.is_some_and(|m| m.solid))
    }

    fn confirmed_index(&self) -> Result<u32, BraidError> {
        let raw = self.get_meta_u64(META_CONFIRMED_INDEX)?;
        u32::try_from(raw).map_err(storage_err)
    }

    fn root_index(&self, id: &MessageId) -> Result<Option<u32>, BraidError> {
        Ok(self.metadata(id)?.map(|m| m.root_index))
    }
}
