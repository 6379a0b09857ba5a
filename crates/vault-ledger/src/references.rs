//! Per-owner file references.
//!
//! A reference is an owner's named handle on a piece of content. The row
//! and its three index entries (by owner, by owner and content, by content)
//! are written in one transaction.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vault_cas::Fingerprint;

use crate::store::MetaStore;
use crate::{LedgerError, Result};

const NEXT_REFERENCE_ID: &str = "next_reference_id";
const MAX_OWNER_LEN: usize = 256;

/// Reference identifier. Allocated from a persistent counter and never
/// reused, so a deleted id stays dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(u64);

impl ReferenceId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    fn from_key_suffix(key: &[u8]) -> Option<Self> {
        let start = key.len().checked_sub(8)?;
        let bytes: [u8; 8] = key[start..].try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReferenceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Opaque owner identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Non-empty, at most 256 bytes, no NUL (the index key separator).
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_OWNER_LEN || id.contains('\0') {
            return Err(LedgerError::InvalidOwner(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn key_prefix(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.0.len() + 1);
        key.extend_from_slice(self.0.as_bytes());
        key.push(0);
        key
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OwnerId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// An owner's handle on shared content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: ReferenceId,
    pub owner: OwnerId,
    pub display_name: String,
    pub is_public: bool,
    pub download_count: u64,
    pub created_at: DateTime<Utc>,
    pub content: Fingerprint,
}

/// Fields supplied by the caller; id and timestamps are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewReference {
    pub owner: OwnerId,
    pub display_name: String,
    pub content: Fingerprint,
    pub is_public: bool,
}

/// Storage of file references.
///
/// The reference manager takes this as a trait object so that tests can
/// make individual operations fail.
pub trait ReferenceTable: Send + Sync {
    fn insert(&self, new: NewReference) -> Result<FileReference>;

    fn get(&self, id: ReferenceId) -> Result<Option<FileReference>>;

    /// Delete and return the reference, or `None` if it did not exist.
    fn remove(&self, id: ReferenceId) -> Result<Option<FileReference>>;

    /// All references of one owner, in id order.
    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<FileReference>>;

    fn owner_references_content(&self, owner: &OwnerId, content: &Fingerprint) -> Result<bool>;

    /// Number of references (any owner) pointing at `content`.
    fn count_for_content(&self, content: &Fingerprint) -> Result<u64>;

    /// Increment the download counter.
    fn record_download(&self, id: ReferenceId) -> Result<Option<FileReference>>;

    fn set_public(&self, id: ReferenceId, public: bool) -> Result<Option<FileReference>>;

    fn all(&self) -> Result<Vec<FileReference>>;
}

/// `ReferenceTable` backed by the shared LMDB environment
pub struct LmdbReferences {
    store: Arc<MetaStore>,
}

impl LmdbReferences {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    fn owner_key(owner: &OwnerId, id: ReferenceId) -> Vec<u8> {
        let mut key = owner.key_prefix();
        key.extend_from_slice(&id.to_key());
        key
    }

    fn owner_content_prefix(owner: &OwnerId, content: &Fingerprint) -> Vec<u8> {
        let mut key = owner.key_prefix();
        key.extend_from_slice(content.as_bytes());
        key
    }

    fn owner_content_key(owner: &OwnerId, content: &Fingerprint, id: ReferenceId) -> Vec<u8> {
        let mut key = Self::owner_content_prefix(owner, content);
        key.extend_from_slice(&id.to_key());
        key
    }

    fn content_key(content: &Fingerprint, id: ReferenceId) -> Vec<u8> {
        let mut key = Vec::with_capacity(Fingerprint::LEN + 8);
        key.extend_from_slice(content.as_bytes());
        key.extend_from_slice(&id.to_key());
        key
    }

    fn update<F>(&self, id: ReferenceId, f: F) -> Result<Option<FileReference>>
    where
        F: FnOnce(&mut FileReference),
    {
        let mut wtxn = self.store.env.write_txn()?;
        let key = id.to_key();
        let mut reference = match self.store.references.get(&wtxn, &key)? {
            Some(reference) => reference,
            None => return Ok(None),
        };
        f(&mut reference);
        self.store.references.put(&mut wtxn, &key, &reference)?;
        wtxn.commit()?;
        Ok(Some(reference))
    }
}

impl ReferenceTable for LmdbReferences {
    fn insert(&self, new: NewReference) -> Result<FileReference> {
        let store = &self.store;
        let mut wtxn = store.env.write_txn()?;

        let next = store.counters.get(&wtxn, NEXT_REFERENCE_ID)?.unwrap_or(1);
        store.counters.put(&mut wtxn, NEXT_REFERENCE_ID, &(next + 1))?;

        let reference = FileReference {
            id: ReferenceId(next),
            owner: new.owner,
            display_name: new.display_name,
            is_public: new.is_public,
            download_count: 0,
            created_at: Utc::now(),
            content: new.content,
        };
        let id = reference.id;

        store.references.put(&mut wtxn, &id.to_key(), &reference)?;
        store
            .owner_refs
            .put(&mut wtxn, &Self::owner_key(&reference.owner, id), &())?;
        store.owner_content.put(
            &mut wtxn,
            &Self::owner_content_key(&reference.owner, &reference.content, id),
            &(),
        )?;
        store
            .content_refs
            .put(&mut wtxn, &Self::content_key(&reference.content, id), &())?;

        wtxn.commit()?;
        Ok(reference)
    }

    fn get(&self, id: ReferenceId) -> Result<Option<FileReference>> {
        let rtxn = self.store.env.read_txn()?;
        Ok(self.store.references.get(&rtxn, &id.to_key())?)
    }

    fn remove(&self, id: ReferenceId) -> Result<Option<FileReference>> {
        let store = &self.store;
        let mut wtxn = store.env.write_txn()?;

        let reference = match store.references.get(&wtxn, &id.to_key())? {
            Some(reference) => reference,
            None => return Ok(None),
        };

        store.references.delete(&mut wtxn, &id.to_key())?;
        store
            .owner_refs
            .delete(&mut wtxn, &Self::owner_key(&reference.owner, id))?;
        store.owner_content.delete(
            &mut wtxn,
            &Self::owner_content_key(&reference.owner, &reference.content, id),
        )?;
        store
            .content_refs
            .delete(&mut wtxn, &Self::content_key(&reference.content, id))?;

        wtxn.commit()?;
        Ok(Some(reference))
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<FileReference>> {
        let store = &self.store;
        let rtxn = store.env.read_txn()?;
        let prefix = owner.key_prefix();

        let mut references = Vec::new();
        for entry in store.owner_refs.prefix_iter(&rtxn, &prefix)? {
            let (key, ()) = entry?;
            let id = ReferenceId::from_key_suffix(key)
                .ok_or_else(|| LedgerError::Corrupted(format!("owner index key for {owner}")))?;
            match store.references.get(&rtxn, &id.to_key())? {
                Some(reference) => references.push(reference),
                None => {
                    return Err(LedgerError::Corrupted(format!(
                        "owner index points at missing reference {id}"
                    )))
                }
            }
        }
        Ok(references)
    }

    fn owner_references_content(&self, owner: &OwnerId, content: &Fingerprint) -> Result<bool> {
        let rtxn = self.store.env.read_txn()?;
        let prefix = Self::owner_content_prefix(owner, content);
        let mut iter = self.store.owner_content.prefix_iter(&rtxn, &prefix)?;
        Ok(iter.next().transpose()?.is_some())
    }

    fn count_for_content(&self, content: &Fingerprint) -> Result<u64> {
        let rtxn = self.store.env.read_txn()?;
        let mut count = 0;
        for entry in self
            .store
            .content_refs
            .prefix_iter(&rtxn, content.as_bytes())?
        {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn record_download(&self, id: ReferenceId) -> Result<Option<FileReference>> {
        self.update(id, |r| r.download_count += 1)
    }

    fn set_public(&self, id: ReferenceId, public: bool) -> Result<Option<FileReference>> {
        self.update(id, |r| r.is_public = public)
    }

    fn all(&self) -> Result<Vec<FileReference>> {
        let rtxn = self.store.env.read_txn()?;
        let mut references = Vec::new();
        for entry in self.store.references.iter(&rtxn)? {
            let (_, reference) = entry?;
            references.push(reference);
        }
        Ok(references)
    }
}
