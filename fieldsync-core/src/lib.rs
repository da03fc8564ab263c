//! Field sync protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives outbound messages.

pub mod hash;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use hash::{hash_content, ContentHash, ContentHasher};
pub use identity::PeerId;
pub use protocol::{ChannelClass, Command, FieldCode, WireVersion, PROTOCOL_VERSION};
pub use wire::{decode_command, encode_command, DecodeError, FieldContentError};
pub use chunk::{FrameError, InboundChunk, OutboundMessage, SessionId};
pub use config::{Config, ConfigError};
pub use crate::core::FieldSyncEngine;
pub use local::{LocalSnapshot, SnapshotError};
pub use observer::{Event, EventKind};

pub mod chunk;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod local;
pub mod observer;
pub mod peer;
pub mod scheduler;
