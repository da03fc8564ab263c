//! Request scheduler: decide which fields to ask a peer for.
//! Freshness gates each field, probation gates peers that never answered.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::identity::PeerId;
use crate::local::LocalStore;
use crate::peer::{PeerStore, Support};
use crate::protocol::{Command, FieldCode};

/// Why a request produced nothing to send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestSkipped {
    #[error("refusing to request from self")]
    SelfPeer,
    #[error("peer identity unknown")]
    UnknownPeer,
    #[error("peer on probation until {until}")]
    Probation { until: u64 },
    #[error("all requested fields are fresh")]
    AllFresh,
}

/// Build the request commands for `codes` and stamp them as refreshed.
/// Bundle members collapse into one bundle request; duplicates are dropped.
pub fn plan_request(
    local: &LocalStore,
    peers: &mut PeerStore,
    self_id: &PeerId,
    peer: &PeerId,
    codes: &[FieldCode],
    config: &Config,
    now: u64,
) -> Result<Vec<Command>, RequestSkipped> {
    if peer == self_id {
        return Err(RequestSkipped::SelfPeer);
    }
    if peer.is_unknown() {
        return Err(RequestSkipped::UnknownPeer);
    }
    if let Some(record) = peers.get(peer) {
        if record.support == Support::Unsupported {
            if let Some(at) = record.probe_at {
                let until = at.saturating_add(config.probe_frequency_secs);
                if now < until {
                    return Err(RequestSkipped::Probation { until });
                }
            }
        }
    }

    let mut wanted: Vec<FieldCode> = Vec::with_capacity(codes.len());
    for &code in codes {
        let code = local.normalize(code);
        if !wanted.contains(&code) {
            wanted.push(code);
        }
    }

    let record = peers.get_or_insert(peer);
    let mut out = Vec::with_capacity(wanted.len());
    for code in wanted {
        let entry = record.field_or_insert(code);
        if entry.is_fresh(now, config.field_frequency_secs) {
            continue;
        }
        out.push(Command::Request {
            code,
            hash: entry.hash,
        });
        entry.touch(now);
    }
    if out.is_empty() {
        return Err(RequestSkipped::AllFresh);
    }
    // Cleared again by the first valid command from the peer.
    if record.support != Support::Supported {
        record.support = Support::Unsupported;
        record.probe_at = Some(now);
    }
    Ok(out)
}

/// Requests waiting for the host's coalescing timer, per peer.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: BTreeMap<PeerId, Vec<FieldCode>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add codes for a peer. Returns true when the queue was empty,
    /// i.e. the host should arm its flush timer now.
    pub fn enqueue(&mut self, peer: PeerId, codes: &[FieldCode]) -> bool {
        let was_empty = self.pending.is_empty();
        let entry = self.pending.entry(peer).or_default();
        for &code in codes {
            if !entry.contains(&code) {
                entry.push(code);
            }
        }
        was_empty
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(PeerId, Vec<FieldCode>)> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}
