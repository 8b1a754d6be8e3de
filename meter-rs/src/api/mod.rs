//! HTTP hook surface for the relay fleet
//!
//! Thin transport glue: deserialize the hook payloads the relay nodes send,
//! call the gateway, serialize the reply. No accounting logic lives here.

pub mod server;

pub use server::ApiServer;
