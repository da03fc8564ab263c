//! Peer store: per-peer cache of remote fields, probation state and inbound buffers.

use std::collections::HashMap;

use crate::chunk::InboundBuffer;
use crate::hash::ContentHash;
use crate::identity::PeerId;
use crate::protocol::{ChannelClass, FieldCode, WireVersion};

/// Whether a peer speaks the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Support {
    #[default]
    Unknown,
    /// Probed and not (yet) answered.
    Unsupported,
    Supported,
}

/// Cached copy of one remote field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteField {
    pub content: String,
    /// `None` until an answer arrives, or when the peer reported the field absent.
    pub hash: Option<ContentHash>,
    pub last_refreshed_at: Option<u64>,
    /// Inbound requests for this field from the peer are ignored until then.
    pub pending_request_until: Option<u64>,
}

impl RemoteField {
    /// Advance the refresh stamp. Never moves backwards.
    pub fn touch(&mut self, now: u64) {
        self.last_refreshed_at = Some(self.last_refreshed_at.map_or(now, |t| t.max(now)));
    }

    /// True when refreshed within `interval` of `now`.
    pub fn is_fresh(&self, now: u64, interval: u64) -> bool {
        self.last_refreshed_at
            .is_some_and(|t| t.saturating_add(interval) > now)
    }
}

/// A reply waiting for the end of the inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedReply {
    pub token: String,
    pub carries_content: bool,
    /// Channel of the inbound payload that asked for it.
    pub source: ChannelClass,
}

/// Everything known about one peer.
#[derive(Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    pub support: Support,
    pub probe_at: Option<u64>,
    pub fields: HashMap<FieldCode, RemoteField>,
    pub version: WireVersion,
    pub(crate) inbound: HashMap<ChannelClass, InboundBuffer>,
    pub(crate) replies: Vec<QueuedReply>,
    pub(crate) first_seen_reported: bool,
}

impl PeerRecord {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            support: Support::Unknown,
            probe_at: None,
            fields: HashMap::new(),
            version: WireVersion::default(),
            inbound: HashMap::new(),
            replies: Vec::new(),
            first_seen_reported: false,
        }
    }

    pub fn field(&self, code: FieldCode) -> Option<&RemoteField> {
        self.fields.get(&code)
    }

    pub fn field_or_insert(&mut self, code: FieldCode) -> &mut RemoteField {
        self.fields.entry(code).or_default()
    }

    /// Any valid inbound command proves support. Returns true the first time.
    pub fn mark_supported(&mut self) -> bool {
        self.support = Support::Supported;
        self.probe_at = None;
        if self.first_seen_reported {
            return false;
        }
        self.first_seen_reported = true;
        true
    }

    pub fn pending_buffers(&self) -> usize {
        self.inbound.len()
    }

    /// Forget replies queued by a payload on `channel` that will never complete.
    pub(crate) fn discard_replies_from(&mut self, channel: ChannelClass) {
        self.replies.retain(|r| r.source != channel);
    }

    /// Forget replies whose inbound payload is no longer pending.
    pub(crate) fn discard_orphan_replies(&mut self) {
        let inbound = &self.inbound;
        self.replies.retain(|r| inbound.contains_key(&r.source));
    }

    /// Created by an inbound reference but holds nothing worth keeping.
    pub(crate) fn is_idle(&self) -> bool {
        self.support == Support::Unknown
            && self.fields.is_empty()
            && self.inbound.is_empty()
            && self.replies.is_empty()
    }
}

/// Owns all peer records, keyed by normalized identity.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(id)
    }

    pub fn get_or_insert(&mut self, id: &PeerId) -> &mut PeerRecord {
        self.peers
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone()))
    }

    pub fn field(&self, id: &PeerId, code: FieldCode) -> Option<&RemoteField> {
        self.peers.get(id).and_then(|p| p.field(code))
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Peer has sent at least one valid command.
    pub fn is_known(&self, id: &PeerId) -> bool {
        self.peers
            .get(id)
            .is_some_and(|p| p.support == Support::Supported)
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.peers.values_mut()
    }

    /// Keep only records for which `keep` returns true. Returns how many were removed.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&PeerRecord) -> bool) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, p| keep(p));
        before - self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> FieldCode {
        FieldCode::parse(s).unwrap()
    }

    #[test]
    fn reads_do_not_insert() {
        let store = PeerStore::new();
        let id = PeerId::new("alice");
        assert!(store.get(&id).is_none());
        assert!(store.field(&id, code("NA")).is_none());
        assert!(!store.is_known(&id));
        assert!(store.is_empty());
    }

    #[test]
    fn get_or_insert_creates_once() {
        let mut store = PeerStore::new();
        let id = PeerId::new("Alice");
        store.get_or_insert(&id).probe_at = Some(5);
        assert_eq!(store.get_or_insert(&PeerId::new("alice")).probe_at, Some(5));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn refresh_stamp_only_advances() {
        let mut f = RemoteField::default();
        f.touch(100);
        f.touch(50);
        assert_eq!(f.last_refreshed_at, Some(100));
        f.touch(130);
        assert_eq!(f.last_refreshed_at, Some(130));
    }

    #[test]
    fn freshness_window() {
        let mut f = RemoteField::default();
        assert!(!f.is_fresh(0, 20));
        f.touch(100);
        assert!(f.is_fresh(119, 20));
        assert!(!f.is_fresh(120, 20));
    }

    #[test]
    fn first_support_reported_once() {
        let mut store = PeerStore::new();
        let id = PeerId::new("bob");
        let rec = store.get_or_insert(&id);
        rec.support = Support::Unsupported;
        rec.probe_at = Some(10);
        assert!(rec.mark_supported());
        assert!(!rec.mark_supported());
        assert_eq!(rec.probe_at, None);
        assert!(store.is_known(&id));
    }

    #[test]
    fn replies_discarded_by_source_channel() {
        let mut rec = PeerRecord::new(PeerId::new("bob"));
        for (token, source) in [("!NA1", ChannelClass::BestEffort), ("NA:x", ChannelClass::Trusted)] {
            rec.replies.push(QueuedReply {
                token: token.into(),
                carries_content: false,
                source,
            });
        }
        rec.discard_replies_from(ChannelClass::BestEffort);
        assert_eq!(rec.replies.len(), 1);
        assert_eq!(rec.replies[0].source, ChannelClass::Trusted);
        // no trusted buffer pending
        rec.discard_orphan_replies();
        assert!(rec.replies.is_empty());
        assert!(rec.is_idle());
    }

    #[test]
    fn retain_drops_idle_records() {
        let mut store = PeerStore::new();
        store.get_or_insert(&PeerId::new("idle"));
        store.get_or_insert(&PeerId::new("known")).mark_supported();
        assert_eq!(store.retain(|p| !p.is_idle()), 1);
        assert!(store.contains(&PeerId::new("known")));
        assert!(!store.contains(&PeerId::new("idle")));
    }
}
