//! Pluggable sync strategies.
//!
//! A session owns exactly one strategy and never mixes them. The diff
//! strategy ships line/char diffs verified by content hash. The CRDT
//! strategy keeps a Yrs document per file and ships document updates, so
//! concurrent edits merge instead of overwriting each other.

use std::collections::HashMap;

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, Text, Transact, Update};

use crate::config::{DiffConfig, StrategyKind};
use crate::diff::{self, DiffEnvelope, DiffPayload};
use crate::error::SyncError;

pub trait SyncStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Encode the change from `old` to `new` for `path`.
    fn compute_delta(&mut self, path: &str, old: &str, new: &str)
        -> Result<DiffEnvelope, SyncError>;

    /// Rebuild content from the local `base` and a remote delta.
    fn apply_delta(
        &mut self,
        path: &str,
        base: &str,
        delta: &DiffEnvelope,
    ) -> Result<String, SyncError>;

    /// Adopt authoritative full content from a peer (resync or snapshot).
    fn merge(&mut self, path: &str, local: Option<&str>, remote: &str) -> Result<String, SyncError>;

    /// Whether received content must match the sender's hash.
    fn verifies_content_hash(&self) -> bool {
        true
    }

    /// Drop any per-path state.
    fn forget(&mut self, _path: &str) {}
}

pub fn strategy_for(kind: StrategyKind, config: &DiffConfig, client_id: u64) -> Box<dyn SyncStrategy> {
    match kind {
        StrategyKind::Diff => Box::new(DiffStrategy::new(config.clone())),
        StrategyKind::Crdt => Box::new(CrdtStrategy::new(client_id)),
    }
}

fn integrity(path: &str, reason: impl std::fmt::Display) -> SyncError {
    SyncError::Integrity {
        path: path.to_owned(),
        reason: reason.to_string(),
    }
}

// ─── Diff ────────────────────────────────────────────────────────────────────

/// Line/char diffs with full-content fallback. Remote full content wins.
pub struct DiffStrategy {
    config: DiffConfig,
}

impl DiffStrategy {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }
}

impl SyncStrategy for DiffStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Diff
    }

    fn compute_delta(
        &mut self,
        _path: &str,
        old: &str,
        new: &str,
    ) -> Result<DiffEnvelope, SyncError> {
        Ok(diff::compute_diff_with(old, new, &self.config))
    }

    fn apply_delta(
        &mut self,
        path: &str,
        base: &str,
        delta: &DiffEnvelope,
    ) -> Result<String, SyncError> {
        diff::apply_diff(base, delta).map_err(|e| integrity(path, e))
    }

    fn merge(
        &mut self,
        _path: &str,
        _local: Option<&str>,
        remote: &str,
    ) -> Result<String, SyncError> {
        Ok(remote.to_owned())
    }
}

// ─── CRDT ────────────────────────────────────────────────────────────────────

const TEXT_NAME: &str = "content";

/// Client id used to seed identical initial content on every peer.
const SEED_CLIENT_ID: u64 = 1;

/// One Yrs document per path.
///
/// A document starts from a seed update authored by [`SEED_CLIENT_ID`], so
/// peers that seed from the same content share the same base history and
/// their later updates merge cleanly.
pub struct CrdtStrategy {
    client_id: u64,
    docs: HashMap<String, Doc>,
}

impl CrdtStrategy {
    pub fn new(client_id: u64) -> Self {
        let client_id = if client_id == SEED_CLIENT_ID {
            client_id + 1
        } else {
            client_id
        };
        Self {
            client_id: client_id.into(),
            docs: HashMap::new(),
        }
    }

    /// Derive a Yrs client id from a participant id.
    pub fn client_id_for(id: uuid::Uuid) -> u64 {
        (id.as_u128() as u64) & 0xFFFF_FFFF
    }

    fn new_doc(client_id: u64) -> Doc {
        Doc::with_options(Options {
            client_id: client_id.into(),
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        })
    }

    fn seeded_doc(&self, content: &str) -> Result<Doc, String> {
        let doc = Self::new_doc(self.client_id);
        if content.is_empty() {
            return Ok(doc);
        }
        let seed = Self::new_doc(SEED_CLIENT_ID);
        let text = seed.get_or_insert_text(TEXT_NAME);
        {
            let mut txn = seed.transact_mut();
            text.insert(&mut txn, 0, content);
        }
        let update = seed
            .transact()
            .encode_state_as_update_v1(&yrs::StateVector::default());
        apply_update(&doc, &update)?;
        Ok(doc)
    }

    fn doc_for(&mut self, path: &str, base: &str) -> Result<&Doc, SyncError> {
        if !self.docs.contains_key(path) {
            let doc = self.seeded_doc(base).map_err(|e| integrity(path, e))?;
            self.docs.insert(path.to_owned(), doc);
        }
        self.docs
            .get(path)
            .ok_or_else(|| integrity(path, "document missing"))
    }

    /// Current text of a path's document, if one exists.
    pub fn text(&self, path: &str) -> Option<String> {
        self.docs.get(path).map(read_text)
    }
}

fn read_text(doc: &Doc) -> String {
    let text = doc.get_or_insert_text(TEXT_NAME);
    let txn = doc.transact();
    text.get_string(&txn)
}

fn apply_update(doc: &Doc, bytes: &[u8]) -> Result<(), String> {
    let update = Update::decode_v1(bytes).map_err(|e| e.to_string())?;
    doc.transact_mut()
        .apply_update(update)
        .map_err(|e| e.to_string())
}

/// Byte range `[start, old_end)` of `old` replaced by `new[start..new_end]`,
/// on char boundaries.
fn changed_span(old: &str, new: &str) -> (usize, usize, usize) {
    let prefix: usize = old
        .char_indices()
        .zip(new.chars())
        .take_while(|((_, a), b)| a == b)
        .map(|((_, a), _)| a.len_utf8())
        .sum();
    let suffix: usize = old[prefix..]
        .chars()
        .rev()
        .zip(new[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    (prefix, old.len() - suffix, new.len() - suffix)
}

impl SyncStrategy for CrdtStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Crdt
    }

    fn compute_delta(
        &mut self,
        path: &str,
        old: &str,
        new: &str,
    ) -> Result<DiffEnvelope, SyncError> {
        let doc = self.doc_for(path, old)?;
        let text = doc.get_or_insert_text(TEXT_NAME);
        let current = read_text(doc);
        let before = doc.transact().state_vector();

        let (start, old_end, new_end) = changed_span(&current, new);
        {
            let mut txn = doc.transact_mut();
            if old_end > start {
                text.remove_range(&mut txn, start as u32, (old_end - start) as u32);
            }
            if new_end > start {
                text.insert(&mut txn, start as u32, &new[start..new_end]);
            }
        }
        let update = doc.transact().encode_diff_v1(&before);
        Ok(DiffEnvelope::crdt(update))
    }

    fn apply_delta(
        &mut self,
        path: &str,
        base: &str,
        delta: &DiffEnvelope,
    ) -> Result<String, SyncError> {
        match &delta.payload {
            DiffPayload::Update(bytes) => {
                let doc = self.doc_for(path, base)?;
                apply_update(doc, bytes).map_err(|e| integrity(path, e))?;
                Ok(read_text(doc))
            }
            // Full content from a resync reply or a peer on the same strategy
            // that skipped the update path.
            DiffPayload::Content(content) => self.merge(path, Some(base), content),
            _ => diff::apply_diff(base, delta).map_err(|e| integrity(path, e)),
        }
    }

    fn merge(
        &mut self,
        path: &str,
        _local: Option<&str>,
        remote: &str,
    ) -> Result<String, SyncError> {
        let doc = self.seeded_doc(remote).map_err(|e| integrity(path, e))?;
        self.docs.insert(path.to_owned(), doc);
        Ok(remote.to_owned())
    }

    fn verifies_content_hash(&self) -> bool {
        false
    }

    fn forget(&mut self, path: &str) {
        self.docs.remove(path);
    }
}
