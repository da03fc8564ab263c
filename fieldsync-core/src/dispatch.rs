//! Protocol dispatcher: apply decoded commands from one peer to the stores and queue replies.

use crate::config::Config;
use crate::hash::{ContentHash, ContentHasher};
use crate::identity::PeerId;
use crate::local::LocalStore;
use crate::observer::Event;
use crate::peer::{PeerRecord, PeerStore, QueuedReply};
use crate::protocol::{ChannelClass, Command, FieldCode, WireVersion};
use crate::wire;

/// Borrowed view of engine state for the duration of one inbound payload.
pub struct Dispatcher<'a> {
    pub local: &'a LocalStore,
    pub peers: &'a mut PeerStore,
    pub hasher: &'a mut ContentHasher,
    pub config: &'a Config,
    pub events: &'a mut Vec<Event>,
}

impl Dispatcher<'_> {
    /// Decode and apply every token of `payload`. Malformed tokens are dropped.
    /// Returns the number of commands applied.
    pub fn dispatch_payload(
        &mut self,
        peer: &PeerId,
        channel: ChannelClass,
        payload: &[u8],
        now: u64,
    ) -> usize {
        let text = String::from_utf8_lossy(payload);
        let mut applied = 0;
        for token in wire::split_tokens(&text) {
            let version = self.peers.get(peer).map(|p| p.version).unwrap_or_default();
            match wire::decode_command(token, version) {
                Ok(cmd) => {
                    self.handle(peer, channel, cmd, now);
                    applied += 1;
                }
                Err(e) => {
                    tracing::trace!(peer = %peer, token = %token, error = %e, "dropping malformed command");
                }
            }
        }
        applied
    }

    pub fn handle(&mut self, peer: &PeerId, channel: ChannelClass, cmd: Command, now: u64) {
        if self.peers.get_or_insert(peer).mark_supported() {
            self.events.push(Event::PeerFirstSeen { peer: peer.clone() });
        }
        match cmd {
            Command::Request { code, hash } => self.on_request(peer, channel, code, hash, now),
            Command::HashAck { code, hash } => self.on_hash_ack(peer, code, hash, now),
            Command::Answer {
                code,
                hash,
                content,
            } => self.on_answer(peer, channel, code, hash, content, now),
        }
    }

    fn on_request(
        &mut self,
        peer: &PeerId,
        channel: ChannelClass,
        code: FieldCode,
        hash: Option<ContentHash>,
        now: u64,
    ) {
        let code = self.local.normalize(code);
        let window = self.config.request_dedup_secs;
        let record = self.peers.get_or_insert(peer);
        let entry = record.field_or_insert(code);
        let repeated = entry.pending_request_until.is_some_and(|until| now < until);
        entry.pending_request_until = Some(now.saturating_add(window));
        if repeated {
            tracing::trace!(peer = %peer, code = %code, "ignoring repeated request");
            return;
        }
        if !self.local.has_committed() {
            return;
        }
        let reply = match hash {
            Some(h) if self.local.current_hash(code) == Some(h) => QueuedReply {
                token: wire::encode_command(&Command::HashAck { code, hash: h }),
                carries_content: false,
                source: channel,
            },
            _ => {
                let (token, carries_content) = self.local.answer_token(code);
                QueuedReply {
                    token,
                    carries_content,
                    source: channel,
                }
            }
        };
        record.replies.push(reply);
    }

    fn on_hash_ack(&mut self, peer: &PeerId, code: FieldCode, hash: ContentHash, now: u64) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        match record.fields.get_mut(&code) {
            Some(f) if f.hash == Some(hash) => f.touch(now),
            _ => tracing::trace!(peer = %peer, code = %code, "ignoring hash ack for a hash not on file"),
        }
    }

    fn on_answer(
        &mut self,
        peer: &PeerId,
        channel: ChannelClass,
        code: FieldCode,
        hash: Option<ContentHash>,
        content: String,
        now: u64,
    ) {
        if channel != ChannelClass::Trusted {
            tracing::debug!(peer = %peer, code = %code, "dropping answer from best-effort channel");
            return;
        }
        let hash = match hash {
            Some(h) => Some(h),
            None if content.is_empty() => None,
            None => Some(self.hasher.hash(&content)),
        };
        let probe_interval = self.config.probe_frequency_secs;
        let record = self.peers.get_or_insert(peer);
        if code == FieldCode::VERSION {
            record.version = WireVersion::negotiate(&content);
        }
        let entry = record.field_or_insert(code);
        entry.content = content.clone();
        entry.hash = hash;
        entry.touch(now);

        if code == FieldCode::BUNDLE {
            // Piggyback refreshes for members the bundle push did not cover.
            for &member in self.local.bundle_codes() {
                let stale = record
                    .field(member)
                    .map_or(true, |f| !f.is_fresh(now, probe_interval));
                if !stale {
                    continue;
                }
                let entry = record.field_or_insert(member);
                let request = Command::Request {
                    code: member,
                    hash: entry.hash,
                };
                entry.touch(now);
                record.replies.push(QueuedReply {
                    token: wire::encode_command(&request),
                    carries_content: false,
                    source: channel,
                });
            }
        }

        let content = if hash.is_none() && content.is_empty() {
            None
        } else {
            Some(content)
        };
        self.events.push(Event::FieldUpdated {
            peer: peer.clone(),
            code,
            content,
            hash,
        });
    }
}

/// Take the replies queued by a completed payload on `source` as one outbound
/// payload, with the channel it needs.
pub fn take_replies(record: &mut PeerRecord, source: ChannelClass) -> Option<(String, ChannelClass)> {
    let (replies, rest): (Vec<QueuedReply>, Vec<QueuedReply>) = std::mem::take(&mut record.replies)
        .into_iter()
        .partition(|r| r.source == source);
    record.replies = rest;
    if replies.is_empty() {
        return None;
    }
    let channel = if replies.iter().any(|r| r.carries_content) {
        ChannelClass::Trusted
    } else {
        ChannelClass::BestEffort
    };
    let tokens: Vec<&str> = replies.iter().map(|r| r.token.as_str()).collect();
    Some((wire::join_tokens(&tokens), channel))
}
