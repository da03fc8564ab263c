//! Message framer: split outbound payloads into transport-sized chunks;
//! reassemble inbound chunks per (peer, channel).

use std::collections::HashMap;

use crate::identity::PeerId;
use crate::protocol::{ChannelClass, SEPARATOR};
use crate::wire;

/// Reference per-message byte limit of the transport.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 255;

/// Smallest limit that still fits the chunk-count header with room for data.
pub const MIN_MESSAGE_LEN: usize = 16;

/// Prefix of the total-chunk-count header carried by the first chunk.
pub const CHUNK_COUNT_PREFIX: &str = "XC=";

/// Tags every chunk of one logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u16);

/// One physical transport message. `index` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u16,
    pub total: u16,
    pub bytes: Vec<u8>,
}

/// Logical message for the host to hand to the transport, chunk by chunk, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub peer: PeerId,
    pub channel: ChannelClass,
    pub session: SessionId,
    pub chunks: Vec<Chunk>,
}

impl OutboundMessage {
    /// Payload as sent, without the chunk-count header.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, c) in self.chunks.iter().enumerate() {
            if i == 0 && self.chunks.len() > 1 {
                out.extend_from_slice(strip_header(&c.bytes).1);
            } else {
                out.extend_from_slice(&c.bytes);
            }
        }
        out
    }

    /// Payload as text (lossy on invalid UTF-8).
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload()).into_owned()
    }
}

fn header(total: usize) -> String {
    format!("{CHUNK_COUNT_PREFIX}{total}{SEPARATOR}")
}

/// Split a payload into chunks of at most `max_len` bytes. Zero uses the default limit.
/// A payload that fits is sent as one chunk without a header.
pub fn split_into_chunks(payload: &[u8], max_len: usize) -> Result<Vec<Chunk>, FrameError> {
    let limit = if max_len == 0 {
        DEFAULT_MAX_MESSAGE_LEN
    } else {
        max_len.max(MIN_MESSAGE_LEN)
    };
    if payload.len() <= limit {
        return Ok(vec![Chunk {
            index: 1,
            total: 1,
            bytes: payload.to_vec(),
        }]);
    }

    // The header length depends on the total it announces; iterate to the fixed point.
    let chunks_needed = |total: usize| {
        let first_cap = limit - header(total).len();
        let rest = payload.len() - first_cap;
        1 + rest.div_ceil(limit)
    };
    let mut total = 2;
    loop {
        let next = chunks_needed(total);
        if next == total {
            break;
        }
        total = next;
    }
    let total_u16 = u16::try_from(total).map_err(|_| FrameError::TooManyChunks(total))?;

    let head = header(total);
    let first_cap = limit - head.len();
    let mut out = Vec::with_capacity(total);
    let mut first = Vec::with_capacity(limit);
    first.extend_from_slice(head.as_bytes());
    first.extend_from_slice(&payload[..first_cap]);
    out.push(Chunk {
        index: 1,
        total: total_u16,
        bytes: first,
    });
    for (i, piece) in payload[first_cap..].chunks(limit).enumerate() {
        out.push(Chunk {
            index: i as u16 + 2,
            total: total_u16,
            bytes: piece.to_vec(),
        });
    }
    Ok(out)
}

/// Error framing an outbound payload.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload needs {0} chunks")]
    TooManyChunks(usize),
}

/// Assigns session ids and frames payloads for one engine.
pub struct Framer {
    max_message_len: usize,
    next_session: u16,
}

impl Framer {
    pub fn new(max_message_len: usize) -> Self {
        Self::with_session_seed(max_message_len, rand::random())
    }

    pub fn with_session_seed(max_message_len: usize, seed: u16) -> Self {
        Self {
            max_message_len,
            next_session: seed,
        }
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    pub fn frame(
        &mut self,
        peer: PeerId,
        channel: ChannelClass,
        payload: &str,
    ) -> Result<OutboundMessage, FrameError> {
        let chunks = split_into_chunks(payload.as_bytes(), self.max_message_len)?;
        let session = SessionId(self.next_session);
        self.next_session = self.next_session.wrapping_add(1);
        Ok(OutboundMessage {
            peer,
            channel,
            session,
            chunks,
        })
    }
}

/// One physical message as delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundChunk {
    pub sender: String,
    pub channel: ChannelClass,
    pub session: SessionId,
    /// 1-based. Zero is treated as a first chunk.
    pub index: u16,
    /// Zero when the transport does not know; the header total is used instead.
    pub total: u16,
    /// Transport completion flag.
    pub is_final: bool,
    pub bytes: Vec<u8>,
}

impl InboundChunk {
    /// A whole payload in a single physical message.
    pub fn single(sender: &str, channel: ChannelClass, session: SessionId, bytes: Vec<u8>) -> Self {
        Self {
            sender: sender.to_owned(),
            channel,
            session,
            index: 1,
            total: 1,
            is_final: true,
            bytes,
        }
    }

    /// Inbound view of every chunk of an outbound message, as if sent by `sender`.
    pub fn from_outbound(sender: &str, msg: &OutboundMessage) -> Vec<Self> {
        msg.chunks
            .iter()
            .map(|c| Self {
                sender: sender.to_owned(),
                channel: msg.channel,
                session: msg.session,
                index: c.index,
                total: c.total,
                is_final: c.index == c.total,
                bytes: c.bytes.clone(),
            })
            .collect()
    }
}

/// Pending multi-chunk payload.
#[derive(Debug)]
pub struct InboundBuffer {
    session: SessionId,
    total: u16,
    next_index: u16,
    started_at: u64,
    data: Vec<u8>,
}

impl InboundBuffer {
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of feeding one chunk to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Payload complete; remaining bytes are ready for dispatch.
    Complete(Vec<u8>),
    /// More chunks expected. Holds separator-terminated commands excised from the
    /// buffer for early dispatch (empty when speculative dispatch is off).
    InProgress(Vec<u8>),
    /// Chunk did not continue any pending payload.
    Discarded,
}

/// Split the chunk-count header off a first chunk. Returns the announced total, if any.
fn strip_header(bytes: &[u8]) -> (Option<u16>, &[u8]) {
    let Some(rest) = bytes.strip_prefix(CHUNK_COUNT_PREFIX.as_bytes()) else {
        return (None, bytes);
    };
    let Some(end) = rest.iter().position(|&b| b == SEPARATOR as u8) else {
        return (None, bytes);
    };
    let total = std::str::from_utf8(&rest[..end])
        .ok()
        .and_then(|s| s.parse::<u16>().ok());
    match total {
        Some(t) => (Some(t), &rest[end + 1..]),
        None => (None, bytes),
    }
}

/// Feed one chunk into the buffers of its sender.
pub fn on_chunk_received(
    buffers: &mut HashMap<ChannelClass, InboundBuffer>,
    chunk: &InboundChunk,
    now: u64,
    speculative: bool,
) -> ChunkReceiveResult {
    let buf = if chunk.index <= 1 {
        if let Some(old) = buffers.remove(&chunk.channel) {
            tracing::debug!(
                session = old.session.0,
                bytes = old.data.len(),
                "dropping superseded incomplete payload"
            );
        }
        let (announced, data) = strip_header(&chunk.bytes);
        let total = if chunk.total > 0 {
            chunk.total
        } else {
            announced.unwrap_or(1)
        };
        if chunk.is_final || total <= 1 {
            return ChunkReceiveResult::Complete(data.to_vec());
        }
        buffers.entry(chunk.channel).or_insert(InboundBuffer {
            session: chunk.session,
            total,
            next_index: 2,
            started_at: now,
            data: data.to_vec(),
        })
    } else {
        let Some(buf) = buffers.get_mut(&chunk.channel) else {
            tracing::debug!(index = chunk.index, "chunk without pending payload, discarding");
            return ChunkReceiveResult::Discarded;
        };
        if buf.session != chunk.session {
            tracing::debug!(
                expected = buf.session.0,
                got = chunk.session.0,
                "chunk from another session, discarding"
            );
            return ChunkReceiveResult::Discarded;
        }
        if chunk.index != buf.next_index {
            tracing::debug!(
                expected = buf.next_index,
                got = chunk.index,
                "chunk gap, dropping payload"
            );
            buffers.remove(&chunk.channel);
            return ChunkReceiveResult::Discarded;
        }
        buf.data.extend_from_slice(&chunk.bytes);
        buf.next_index = buf.next_index.saturating_add(1);
        if chunk.is_final || chunk.index >= buf.total {
            return match buffers.remove(&chunk.channel) {
                Some(done) => ChunkReceiveResult::Complete(done.data),
                None => ChunkReceiveResult::Discarded,
            };
        }
        buf
    };

    if !speculative {
        return ChunkReceiveResult::InProgress(Vec::new());
    }
    let cut = wire::terminated_prefix_len(&buf.data);
    ChunkReceiveResult::InProgress(buf.data.drain(..cut).collect())
}

/// Drop buffers started more than `max_age` ago. Returns how many were dropped.
pub fn prune_stale(
    buffers: &mut HashMap<ChannelClass, InboundBuffer>,
    now: u64,
    max_age: u64,
) -> usize {
    let before = buffers.len();
    buffers.retain(|_, b| b.started_at.saturating_add(max_age) > now);
    before - buffers.len()
}
