//! Wire types shared by the gateway, the CLI client, and tests.
//!
//! Everything that crosses the WebSocket boundary lives here. The codec is
//! deliberately the single place where the wire format is interpreted:
//! components above it only ever see typed frames.

mod models;
mod wire;

pub use models::ModelDescriptor;
pub use wire::{
    decode_client_frame, ChatMessage, ChunkKind, ClientFrame, DecodeError, Role, StreamChunk,
};
