// src/core/protocol/mod.rs

//! The controller wire protocol: packing primitives, message definitions
//! and the stream codec.

pub mod codec;
pub mod message;
pub mod pack;

pub use codec::MessageCodec;
pub use message::{Body, Header, Message, MessageType, PROTOCOL_VERSION};
