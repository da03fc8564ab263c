//! Local field store: this client's own fields, change detection and the summary bundle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, ContentHasher};
use crate::protocol::{Command, FieldCode, CONTENT_DELIMITER, PROTOCOL_VERSION, SEPARATOR};
use crate::wire::{self, FieldContentError};

/// One committed local field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalField {
    pub code: FieldCode,
    pub content: String,
    pub hash: ContentHash,
}

/// Change produced by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Updated {
        code: FieldCode,
        content: String,
        hash: ContentHash,
    },
    Cleared {
        code: FieldCode,
    },
}

/// Result of [`LocalStore::commit`].
#[derive(Debug, Default)]
pub struct CommitReport {
    pub changed: bool,
    pub changes: Vec<LocalChange>,
    /// Edits that were refused; the previous value was kept.
    pub rejected: Vec<FieldContentError>,
}

/// Cached summary bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub hash: ContentHash,
    /// Member entries joined by the separator, without the trailing `TT` token.
    pub body: String,
    /// Full wire form: body followed by `TT<hash>`.
    pub token: String,
    carries_content: bool,
}

/// Local hashes persisted by the host across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSnapshot {
    pub hashes: BTreeMap<FieldCode, ContentHash>,
}

impl LocalSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(self).map_err(SnapshotError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        bincode::deserialize(bytes).map_err(SnapshotError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
}

/// Owns this client's fields. Mutated only through the owner's edit calls.
pub struct LocalStore {
    staged: BTreeMap<FieldCode, String>,
    committed: BTreeMap<FieldCode, LocalField>,
    bundle_codes: Vec<FieldCode>,
    bundle: Option<Bundle>,
    bundle_dirty: bool,
    /// Set by the first owner edit; commit is a no-op before that.
    touched: bool,
    committed_once: bool,
    restored: BTreeMap<FieldCode, ContentHash>,
    hasher: ContentHasher,
}

impl LocalStore {
    pub fn new(bundle_codes: Vec<FieldCode>) -> Self {
        Self::with_hasher(bundle_codes, ContentHasher::new())
    }

    pub fn with_hasher(bundle_codes: Vec<FieldCode>, hasher: ContentHasher) -> Self {
        let mut staged = BTreeMap::new();
        staged.insert(FieldCode::VERSION, PROTOCOL_VERSION.to_string());
        let mut codes: Vec<FieldCode> = Vec::with_capacity(bundle_codes.len());
        for code in bundle_codes {
            if code != FieldCode::BUNDLE && !codes.contains(&code) {
                codes.push(code);
            }
        }
        Self {
            staged,
            committed: BTreeMap::new(),
            bundle_codes: codes,
            bundle: None,
            bundle_dirty: true,
            touched: false,
            committed_once: false,
            restored: BTreeMap::new(),
            hasher,
        }
    }

    /// Stage new content for a field. Takes effect on the next commit.
    pub fn set_field(&mut self, code: FieldCode, content: impl Into<String>) {
        self.touched = true;
        self.staged.insert(code, content.into());
    }

    /// Stage removal of a field. The commit reports it as cleared.
    pub fn remove_field(&mut self, code: FieldCode) {
        self.touched = true;
        self.staged.remove(&code);
    }

    /// Append a member to the bundle list (no-op if already present).
    pub fn register_bundle_code(&mut self, code: FieldCode) {
        if code == FieldCode::BUNDLE || self.bundle_codes.contains(&code) {
            return;
        }
        self.bundle_codes.push(code);
        self.bundle_dirty = true;
    }

    pub fn bundle_codes(&self) -> &[FieldCode] {
        &self.bundle_codes
    }

    pub fn is_bundle_member(&self, code: FieldCode) -> bool {
        self.bundle_codes.contains(&code)
    }

    /// Map bundle members to the bundle code; other codes pass through.
    pub fn normalize(&self, code: FieldCode) -> FieldCode {
        if self.is_bundle_member(code) {
            FieldCode::BUNDLE
        } else {
            code
        }
    }

    pub fn has_committed(&self) -> bool {
        self.committed_once
    }

    pub fn get(&self, code: FieldCode) -> Option<&LocalField> {
        self.committed.get(&code)
    }

    pub fn bundle(&self) -> Option<&Bundle> {
        self.bundle.as_ref()
    }

    /// Current hash of a committed field or of the bundle.
    pub fn current_hash(&self, code: FieldCode) -> Option<ContentHash> {
        if code == FieldCode::BUNDLE {
            return self.bundle.as_ref().map(|b| b.hash);
        }
        self.committed.get(&code).map(|f| f.hash)
    }

    /// Token answering a request for `code`, and whether it carries content.
    pub fn answer_token(&self, code: FieldCode) -> (String, bool) {
        if code == FieldCode::BUNDLE {
            if let Some(b) = &self.bundle {
                return (b.token.clone(), b.carries_content);
            }
        }
        let cmd = match self.committed.get(&code) {
            Some(f) => Command::Answer {
                code,
                hash: Some(f.hash),
                content: f.content.clone(),
            },
            None => Command::Answer {
                code,
                hash: None,
                content: String::new(),
            },
        };
        let carries = cmd.carries_content();
        (wire::encode_command(&cmd), carries)
    }

    /// Apply staged edits. See [`CommitReport`].
    pub fn commit(&mut self) -> CommitReport {
        let mut report = CommitReport::default();
        if !self.touched {
            return report;
        }

        let mut rejected_codes = Vec::new();
        for (code, content) in &self.staged {
            if let Err(e) = wire::validate_content(*code, content) {
                tracing::warn!(code = %code, error = %e, "rejecting local field edit");
                report.rejected.push(e);
                rejected_codes.push(*code);
            }
        }
        for code in rejected_codes {
            match self.committed.get(&code) {
                Some(prev) => {
                    self.staged.insert(code, prev.content.clone());
                }
                None => {
                    self.staged.remove(&code);
                }
            }
        }

        let cleared: Vec<FieldCode> = self
            .committed
            .keys()
            .filter(|c| !self.staged.contains_key(*c))
            .copied()
            .collect();
        for code in cleared {
            self.committed.remove(&code);
            if self.bundle_codes.contains(&code) {
                self.bundle_dirty = true;
            }
            report.changes.push(LocalChange::Cleared { code });
        }

        for (code, content) in &self.staged {
            let unchanged = self
                .committed
                .get(code)
                .is_some_and(|f| f.content == *content);
            if unchanged {
                continue;
            }
            let hash = self.hasher.hash(content);
            self.committed.insert(
                *code,
                LocalField {
                    code: *code,
                    content: content.clone(),
                    hash,
                },
            );
            if self.bundle_codes.contains(code) {
                self.bundle_dirty = true;
            }
            if self.restored.get(code) == Some(&hash) {
                continue;
            }
            report.changes.push(LocalChange::Updated {
                code: *code,
                content: content.clone(),
                hash,
            });
        }
        self.restored.clear();

        let previous_bundle = self.bundle.as_ref().map(|b| b.hash);
        if self.bundle_dirty || self.bundle.is_none() {
            self.bundle = Some(self.build_bundle());
            self.bundle_dirty = false;
        }
        let bundle_changed = self.bundle.as_ref().map(|b| b.hash) != previous_bundle;

        self.committed_once = true;
        report.changed = !report.changes.is_empty() || (bundle_changed && previous_bundle.is_some());
        report
    }

    fn build_bundle(&mut self) -> Bundle {
        let mut entries = Vec::with_capacity(self.bundle_codes.len());
        let mut carries_content = false;
        for code in &self.bundle_codes {
            match self.committed.get(code) {
                Some(f) if !f.content.is_empty() => {
                    carries_content = true;
                    entries.push(format!("{code}{CONTENT_DELIMITER}{}", f.content));
                }
                _ => entries.push(code.to_string()),
            }
        }
        let body = wire::join_tokens(&entries);
        let hash = self.hasher.hash(&body);
        let token = format!("{body}{SEPARATOR}{}{hash}", FieldCode::BUNDLE);
        Bundle {
            hash,
            body,
            token,
            carries_content,
        }
    }

    /// Committed hashes for the host to persist.
    pub fn snapshot(&self) -> LocalSnapshot {
        LocalSnapshot {
            hashes: self
                .committed
                .iter()
                .map(|(code, f)| (*code, f.hash))
                .collect(),
        }
    }

    /// Seed the previous-commit hashes so an unchanged field is not reported after a restart.
    pub fn restore(&mut self, snapshot: LocalSnapshot) {
        self.restored = snapshot.hashes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> FieldCode {
        FieldCode::parse(s).unwrap()
    }

    fn store() -> LocalStore {
        LocalStore::new(vec![code("VP"), code("NA"), code("RA")])
    }

    #[test]
    fn commit_before_any_edit_is_noop() {
        let mut s = store();
        let r = s.commit();
        assert!(!r.changed);
        assert!(!s.has_committed());
        assert!(s.bundle().is_none());
    }

    #[test]
    fn scenario_bundle_token() {
        let mut s = store();
        s.set_field(code("NA"), "Alice");
        s.set_field(code("RA"), "Human");
        let r = s.commit();
        assert!(r.changed);
        let b = s.bundle().unwrap().clone();
        assert_eq!(b.body, "VP:1\u{1}NA:Alice\u{1}RA:Human");
        assert_eq!(b.token, format!("{}\u{1}TT{}", b.body, b.hash));
        assert_eq!(s.current_hash(FieldCode::BUNDLE), Some(b.hash));
    }

    #[test]
    fn second_commit_is_idempotent() {
        let mut s = store();
        s.set_field(code("NA"), "Alice");
        assert!(s.commit().changed);
        let token = s.bundle().unwrap().token.clone();
        let r = s.commit();
        assert!(!r.changed);
        assert!(r.changes.is_empty());
        assert_eq!(s.bundle().unwrap().token, token);
    }

    #[test]
    fn updated_and_cleared_changes() {
        let mut s = store();
        s.set_field(code("NA"), "Alice");
        s.set_field(code("DE"), "Tall");
        s.commit();
        s.remove_field(code("DE"));
        s.set_field(code("NA"), "Alicia");
        let r = s.commit();
        assert!(r.changed);
        assert!(r.changes.contains(&LocalChange::Cleared { code: code("DE") }));
        assert!(r.changes.iter().any(|c| matches!(
            c,
            LocalChange::Updated { code: k, content, .. } if *k == code("NA") && content == "Alicia"
        )));
        assert!(s.get(code("DE")).is_none());
    }

    #[test]
    fn raw_separator_rejected_previous_kept() {
        let mut s = store();
        s.set_field(code("NA"), "Alice");
        s.commit();
        s.set_field(code("NA"), "Al\u{1}ice");
        let r = s.commit();
        assert!(!r.changed);
        assert_eq!(r.rejected.len(), 1);
        assert_eq!(s.get(code("NA")).unwrap().content, "Alice");

        s.set_field(code("NA"), "Al\u{1b}\u{1}ice");
        let r = s.commit();
        assert!(r.changed);
        assert!(r.rejected.is_empty());
    }

    #[test]
    fn rejected_new_field_stays_absent() {
        let mut s = store();
        s.set_field(code("DE"), "bad\u{1}");
        let r = s.commit();
        assert_eq!(r.rejected.len(), 1);
        assert!(s.get(code("DE")).is_none());
        // staged value was reverted, so the next commit is clean
        assert!(s.commit().rejected.is_empty());
    }

    #[test]
    fn bundle_hash_tracks_member_content_only() {
        let mut s = store();
        s.set_field(code("NA"), "Alice");
        s.commit();
        let h1 = s.current_hash(FieldCode::BUNDLE).unwrap();

        s.set_field(code("DE"), "not a member");
        s.commit();
        assert_eq!(s.current_hash(FieldCode::BUNDLE), Some(h1));

        s.set_field(code("RA"), "Human");
        s.commit();
        let h2 = s.current_hash(FieldCode::BUNDLE).unwrap();
        assert_ne!(h1, h2);

        s.set_field(code("RA"), "Human");
        s.commit();
        assert_eq!(s.current_hash(FieldCode::BUNDLE), Some(h2));
    }

    #[test]
    fn register_member_rebuilds_bundle() {
        let mut s = store();
        s.set_field(code("DE"), "Tall");
        s.commit();
        let before = s.bundle().unwrap().body.clone();
        s.register_bundle_code(code("DE"));
        assert!(s.commit().changed);
        assert_eq!(s.bundle().unwrap().body, format!("{before}\u{1}DE:Tall"));
        assert_eq!(s.normalize(code("DE")), FieldCode::BUNDLE);
    }

    #[test]
    fn empty_field_answers_with_sentinel() {
        let mut s = store();
        s.set_field(code("DE"), "");
        s.commit();
        let (token, carries) = s.answer_token(code("DE"));
        assert_eq!(token, "DEFFFFFFFF");
        assert!(!carries);
        let (token, _) = s.answer_token(code("MO"));
        assert_eq!(token, "MO");
    }

    #[test]
    fn snapshot_restore_suppresses_unchanged() {
        let mut s = store();
        s.set_field(code("NA"), "Alice");
        s.set_field(code("RA"), "Human");
        s.commit();
        let bytes = s.snapshot().to_bytes().unwrap();

        let mut restarted = store();
        restarted.restore(LocalSnapshot::from_bytes(&bytes).unwrap());
        restarted.set_field(code("NA"), "Alice");
        restarted.set_field(code("RA"), "Orc");
        let r = restarted.commit();
        let updated: Vec<FieldCode> = r
            .changes
            .iter()
            .filter_map(|c| match c {
                LocalChange::Updated { code, .. } => Some(*code),
                _ => None,
            })
            .collect();
        assert_eq!(updated, vec![code("RA")]);
    }
}
