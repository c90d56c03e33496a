//! Fleetstore Fabric - channels between the control plane and storage nodes
//!
//! The [`Fabric`] keeps one [`Connection`] per storage node. Links are
//! established direct-first with a NAT-traversal fallback negotiated through
//! a rendezvous endpoint, kept warm by keepalive probes, demoted to stale by
//! a periodic sweep and re-established after a fixed backoff. Lifecycle
//! changes are broadcast as [`FabricEvent`]s for health bookkeeping.
//!
//! Storage agents run the other end of every link with [`serve_link`] and a
//! [`RequestHandler`].

pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod frame;
pub mod pool;
pub mod protocol;
pub mod rendezvous;
pub mod responder;
pub mod transport;

pub use connection::{ConnState, Connection};
pub use diagnostics::{TestResult, TestState, bandwidth_test, connectivity_test};
pub use error::{FabricError, FabricResult};
pub use event::{FabricEvent, FabricEventKind};
pub use pool::Fabric;
pub use protocol::{NodeRequest, NodeResponse, RemoteError, RemoteErrorCode};
pub use rendezvous::{RendezvousServer, Signal, register_candidates};
pub use responder::{RequestHandler, serve_link, serve_listener};
pub use transport::{
    DirectTransport, Link, MemoryTransport, NatTraversalTransport, PeerAddress, Transport, TransportKind,
};
