//! Session runtime and transports for the Files remote-control IPC server.
//!
//! The host file manager embeds this crate: it registers its shells (as
//! [`adapter::ShellAdapter`] implementations) with a
//! [`registry::ShellRegistry`], assembles a [`service::IpcService`] over
//! the two transports, and pushes state changes through an
//! [`events::ShellEventPublisher`]. Local clients discover the endpoint
//! through the rendezvous descriptor written by `files-ipc-core` and speak
//! JSON-RPC 2.0 over either transport.
//!
//! ```text
//! bytes ─ transport framer ─ Message ─ SessionRuntime ─ Coordinator
//!                                          │                 │
//!                                     send queues        ShellAdapter
//!                                          │            (via UiQueue)
//! bytes ─ transport framer ◀── per-session send loop ◀──── result
//! ```

pub mod adapter;
pub mod coordinator;
pub mod events;
pub mod methods;
pub mod rate_limit;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod session;
pub mod transport;
pub mod ui_queue;

pub use adapter::{ActionDescriptor, AdapterError, ItemMetadata, ShellAdapter, ShellState};
pub use coordinator::Coordinator;
pub use events::{SelectionItem, ShellEventPublisher};
pub use methods::{MethodDefinition, MethodRegistry};
pub use registry::{ShellDescriptor, ShellRegistry, ShellSummary};
pub use runtime::{DispatchFailure, RequestDispatcher, RuntimeError, SessionRuntime};
pub use service::{IpcService, ServiceError};
pub use session::{ClientSession, SessionId};
pub use transport::pipe::PipeTransport;
pub use transport::websocket::WebSocketTransport;
pub use transport::{SessionSink, TransportError, TransportKind, TransportListener};
pub use ui_queue::{UiQueue, UiQueueError};
