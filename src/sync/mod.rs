//! Replication of the shared map state between replicas.
//!
//! # Module Structure
//!
//! - `doc` - Replicated document contract and the LWW map implementation
//! - `transport` - Connection contract, status, backoff, WebSocket + memory transports
//! - `cache` - Durable local cache and its background writer
//! - `presence` - Ephemeral per-participant state
//! - `projection` - Publish (state to doc) and absorb (doc to state) diffing
//! - `engine` - `SyncEngine` actor tying the pieces to a `Store`
//! - `relay` - Session relay server
//!
//! # Architecture
//!
//! ```text
//!   Store ──Transition──► SyncEngine ──WireMessage──► Transport ──► peers
//!     ▲                      │   ▲                        │
//!     └───RemoteUpdate───────┘   └──────TransportEvent────┘
//!                            │
//!                            └──► CacheWriter (thread) ──► DurableCache
//! ```

pub mod cache;
pub mod doc;
pub mod engine;
pub mod presence;
pub mod projection;
pub mod relay;
pub mod transport;

pub use cache::{CacheError, DurableCache, FileCache, MemoryCache};
pub use doc::{LwwDoc, ReplicaId, ReplicatedDoc, Stamp, Update, Versions};
pub use engine::{SyncEngine, SyncOptions};
pub use presence::{Awareness, PresenceState};
pub use transport::{
    Backoff, ConnectionStatus, MemoryHub, Transport, TransportError, TransportEvent, WireMessage,
    WsTransport,
};
