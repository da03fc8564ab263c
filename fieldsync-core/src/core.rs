//! Main engine: FieldSyncEngine. Host feeds chunks, timer expiries and local edits;
//! the engine returns outbound messages and notifies observers.

use crate::chunk::{self, ChunkReceiveResult, Framer, InboundChunk, OutboundMessage};
use crate::config::{Config, ConfigError};
use crate::dispatch::{self, Dispatcher};
use crate::hash::ContentHasher;
use crate::identity::PeerId;
use crate::local::{LocalChange, LocalSnapshot, LocalStore};
use crate::observer::{Event, EventKind, Observers};
use crate::peer::PeerStore;
use crate::protocol::{ChannelClass, Command, FieldCode, WireVersion};
use crate::scheduler::{self, RequestQueue};
use crate::wire;

/// Field sync engine. One per local client; not shared across threads.
pub struct FieldSyncEngine {
    self_id: PeerId,
    config: Config,
    local: LocalStore,
    peers: PeerStore,
    /// Hashes inbound content that arrived without a hash.
    hasher: ContentHasher,
    framer: Framer,
    observers: Observers,
    requests: RequestQueue,
}

impl FieldSyncEngine {
    pub fn new(self_id: &str, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let bundle_codes = config.bundle_field_codes()?;
        let capacity = config.hash_cache_capacity;
        Ok(Self {
            self_id: PeerId::new(self_id),
            local: LocalStore::with_hasher(bundle_codes, ContentHasher::with_capacity(capacity)),
            peers: PeerStore::new(),
            hasher: ContentHasher::with_capacity(capacity),
            framer: Framer::new(config.max_message_len),
            observers: Observers::new(),
            requests: RequestQueue::new(),
            config,
        })
    }

    /// Like [`new`](Self::new), seeded with hashes persisted from a previous run.
    pub fn with_snapshot(
        self_id: &str,
        config: Config,
        snapshot: LocalSnapshot,
    ) -> Result<Self, ConfigError> {
        let mut engine = Self::new(self_id, config)?;
        engine.local.restore(snapshot);
        Ok(engine)
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn peers(&self) -> &PeerStore {
        &self.peers
    }

    pub fn snapshot(&self) -> LocalSnapshot {
        self.local.snapshot()
    }

    // --- local fields ---

    /// Stage a value; takes effect on the next [`update_local_profile`](Self::update_local_profile).
    pub fn set_field(&mut self, code: FieldCode, content: impl Into<String>) {
        self.local.set_field(code, content);
    }

    pub fn remove_field(&mut self, code: FieldCode) {
        self.local.remove_field(code);
    }

    pub fn register_bundle_code(&mut self, code: FieldCode) {
        self.local.register_bundle_code(code);
    }

    /// Commit staged edits. Returns true when anything observable changed.
    pub fn update_local_profile(&mut self) -> bool {
        let report = self.local.commit();
        let events: Vec<Event> = report
            .changes
            .into_iter()
            .map(|change| match change {
                LocalChange::Updated {
                    code,
                    content,
                    hash,
                } => Event::FieldUpdated {
                    peer: self.self_id.clone(),
                    code,
                    content: Some(content),
                    hash: Some(hash),
                },
                LocalChange::Cleared { code } => Event::FieldUpdated {
                    peer: self.self_id.clone(),
                    code,
                    content: None,
                    hash: None,
                },
            })
            .collect();
        if report.changed {
            tracing::debug!(changes = events.len(), "local profile committed");
        }
        self.emit_all(&events);
        report.changed
    }

    // --- requests ---

    /// Ask `peer` for `codes` (the bundle when `None` or empty). Returns `None` when
    /// the peer is refused, on probation, or everything asked for is fresh.
    pub fn request_fields(
        &mut self,
        peer: &str,
        codes: Option<&[FieldCode]>,
        now: u64,
    ) -> Option<OutboundMessage> {
        let peer = PeerId::new(peer);
        let codes: &[FieldCode] = match codes {
            Some(codes) if !codes.is_empty() => codes,
            _ => &[FieldCode::BUNDLE],
        };
        self.request_now(&peer, codes, now)
    }

    /// Queue codes for the next [`flush_requests`](Self::flush_requests).
    /// Returns true when the host should arm its flush timer.
    pub fn queue_request(&mut self, peer: &str, codes: &[FieldCode]) -> bool {
        let codes: &[FieldCode] = if codes.is_empty() {
            &[FieldCode::BUNDLE]
        } else {
            codes
        };
        self.requests.enqueue(PeerId::new(peer), codes)
    }

    /// Flush timer fired: one message per peer with queued codes.
    pub fn flush_requests(&mut self, now: u64) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        for (peer, codes) in self.requests.drain() {
            if let Some(msg) = self.request_now(&peer, &codes, now) {
                out.push(msg);
            }
        }
        out
    }

    fn request_now(&mut self, peer: &PeerId, codes: &[FieldCode], now: u64) -> Option<OutboundMessage> {
        match scheduler::plan_request(
            &self.local,
            &mut self.peers,
            &self.self_id,
            peer,
            codes,
            &self.config,
            now,
        ) {
            Ok(cmds) => {
                let tokens: Vec<String> = cmds.iter().map(wire::encode_command).collect();
                self.frame(peer.clone(), ChannelClass::BestEffort, &wire::join_tokens(&tokens))
            }
            Err(skipped) => {
                tracing::debug!(peer = %peer, reason = %skipped, "request skipped");
                None
            }
        }
    }

    /// Send pre-encoded tokens verbatim. Malformed tokens are dropped.
    pub fn send_raw(&mut self, peer: &str, tokens: &[&str]) -> Option<OutboundMessage> {
        let peer = PeerId::new(peer);
        let mut kept = Vec::with_capacity(tokens.len());
        let mut carries_content = false;
        for &token in tokens {
            let checked = wire::decode_command(token, WireVersion::default())
                .map_err(|e| e.to_string())
                .and_then(|cmd| match &cmd {
                    Command::Answer { code, content, .. } => wire::validate_content(*code, content)
                        .map(|_| cmd.carries_content())
                        .map_err(|e| e.to_string()),
                    _ => Ok(false),
                });
            match checked {
                Ok(carries) => {
                    carries_content |= carries;
                    kept.push(token);
                }
                Err(error) => tracing::warn!(peer = %peer, token, %error, "dropping malformed token"),
            }
        }
        if kept.is_empty() {
            return None;
        }
        let channel = if carries_content {
            ChannelClass::Trusted
        } else {
            ChannelClass::BestEffort
        };
        self.frame(peer, channel, &wire::join_tokens(&kept))
    }

    /// Peer has sent at least one valid command.
    pub fn is_known_peer(&self, peer: &str) -> bool {
        self.peers.is_known(&PeerId::new(peer))
    }

    // --- transport events ---

    /// One physical message arrived. Returns replies to send, if the payload completed.
    pub fn on_chunk_received(&mut self, chunk: InboundChunk, now: u64) -> Vec<OutboundMessage> {
        let peer = PeerId::new(&chunk.sender);
        if peer.is_unknown() || peer == self.self_id {
            tracing::trace!(sender = %peer, "ignoring chunk from unusable sender");
            return Vec::new();
        }
        let speculative = self.config.speculative_dispatch;
        let record = self.peers.get_or_insert(&peer);
        let pending = record.inbound.contains_key(&chunk.channel);
        let result = chunk::on_chunk_received(&mut record.inbound, &chunk, now, speculative);
        // A first chunk supersedes the pending payload and a gap drops it;
        // either way its replies will never be flushed.
        let abandoned = pending
            && (chunk.index <= 1
                || (matches!(result, ChunkReceiveResult::Discarded)
                    && !record.inbound.contains_key(&chunk.channel)));
        if abandoned {
            record.discard_replies_from(chunk.channel);
        }
        let (ready, complete) = match result {
            ChunkReceiveResult::Complete(bytes) => (bytes, true),
            ChunkReceiveResult::InProgress(bytes) => (bytes, false),
            ChunkReceiveResult::Discarded => {
                if record.is_idle() {
                    self.peers.remove(&peer);
                }
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        if !ready.is_empty() {
            let mut dispatcher = Dispatcher {
                local: &self.local,
                peers: &mut self.peers,
                hasher: &mut self.hasher,
                config: &self.config,
                events: &mut events,
            };
            dispatcher.dispatch_payload(&peer, chunk.channel, &ready, now);
        }

        let mut out = Vec::new();
        if complete {
            let replies = self
                .peers
                .get_mut(&peer)
                .and_then(|r| dispatch::take_replies(r, chunk.channel));
            if let Some((payload, channel)) = replies {
                if let Some(msg) = self.frame(peer.clone(), channel, &payload) {
                    out.push(msg);
                }
            }
            events.push(Event::MessageFullyReceived { peer });
        }
        self.emit_all(&events);
        out
    }

    /// Host could not deliver to `peer`. No retry; observers decide.
    pub fn on_transport_error(&mut self, peer: &str) {
        let peer = PeerId::new(peer);
        tracing::debug!(peer = %peer, "transport error");
        self.emit_all(&[Event::TransportError { peer }]);
    }

    /// Drop incomplete inbound payloads older than the buffer timeout, with
    /// the replies they queued, then forget peers left with no state.
    /// Returns how many payloads were dropped.
    pub fn prune_stale_buffers(&mut self, now: u64) -> usize {
        let max_age = self.config.buffer_timeout_secs;
        let mut dropped = 0;
        for record in self.peers.iter_mut() {
            let n = chunk::prune_stale(&mut record.inbound, now, max_age);
            if n > 0 {
                record.discard_orphan_replies();
            }
            dropped += n;
        }
        let forgotten = self.peers.retain(|p| !p.is_idle());
        if dropped > 0 || forgotten > 0 {
            tracing::debug!(dropped, forgotten, "pruned stale inbound state");
        }
        dropped
    }

    // --- observers ---

    pub fn observe<F>(&mut self, kind: EventKind, observer: F)
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.observers.register(kind, observer);
    }

    pub fn observe_field_updated<F>(&mut self, observer: F)
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.observe(EventKind::FieldUpdated, observer);
    }

    pub fn observe_message_fully_received<F>(&mut self, observer: F)
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.observe(EventKind::MessageFullyReceived, observer);
    }

    pub fn observe_transport_error<F>(&mut self, observer: F)
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.observe(EventKind::TransportError, observer);
    }

    pub fn observe_peer_first_seen<F>(&mut self, observer: F)
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.observe(EventKind::PeerFirstSeen, observer);
    }

    fn emit_all(&mut self, events: &[Event]) {
        for event in events {
            self.observers.emit(event);
        }
    }

    fn frame(&mut self, peer: PeerId, channel: ChannelClass, payload: &str) -> Option<OutboundMessage> {
        match self.framer.frame(peer, channel, payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!(error = %e, bytes = payload.len(), "dropping unframeable payload");
                None
            }
        }
    }
}
