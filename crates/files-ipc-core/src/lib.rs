//! Transport-independent primitives for the Files remote-control IPC server.
//!
//! This crate holds everything the session runtime needs that does not touch
//! a socket: the JSON-RPC 2.0 envelope, the runtime caps, the encrypted
//! shared-secret store, the rendezvous descriptor file local clients use to
//! discover the endpoint, request-path validation, and the error scrubber
//! applied to every wire-bound failure message.
//!
//! # Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  files-ipc-server (runtime, transports) │
//! ├─────────────────────────────────────────┤
//! │  files-ipc-core (this crate)            │
//! │    message   JSON-RPC envelope          │
//! │    token     secret + epoch lifecycle   │
//! │    rendezvous  endpoint discovery file  │
//! │    config    runtime caps               │
//! │    paths     request path validation    │
//! │    sanitize  wire error scrubbing       │
//! └─────────────────────────────────────────┘
//! ```

pub mod config;
pub mod message;
pub mod paths;
pub mod rendezvous;
pub mod sanitize;
pub mod token;

pub use config::IpcConfig;
pub use message::{codes, ErrorObject, Message, MessageError};
pub use paths::{normalize_request_path, PathRejection};
pub use rendezvous::{Descriptor, Rendezvous, RendezvousError};
pub use sanitize::{sanitize_error_message, sanitize_failure, FailureClass};
pub use token::{FileTokenStore, InMemoryTokenStore, TokenStore, TokenStoreError};
