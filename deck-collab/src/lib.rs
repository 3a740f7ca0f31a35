//! # deck-collab: Real-time collaboration layer for Deck
//!
//! Connects a [`deck_core::DocumentStore`] to its peers over WebSocket and
//! to the server of record over REST.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   JSON envelopes   ┌─────────────┐
//! │ DocumentSession │ ◄────────────────► │ RelayServer │
//! │ (per user)      │   SyncTransport    │ (rooms)     │
//! └───────┬─────────┘                    └──────┬──────┘
//!         │                                     │
//!         ▼                             ┌───────┴───────┐
//! ┌─────────────────┐                   │ BroadcastGroup│
//! │ PersistenceGate │ ── REST ──► API   │ (fan-out)     │
//! └─────────────────┘                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes tagged by `type`
//! - [`transport`]: WebSocket client with reconnect policy
//! - [`reconciler`]: applies remote envelopes to the store
//! - [`presence`]: roster of remote participants
//! - [`persistence`]: authenticated REST writes with debouncing
//! - [`session`]: one open presentation, wiring everything together
//! - [`broadcast`], [`server`]: the relay
//! - [`config`]: session, transport and relay settings

pub mod broadcast;
pub mod config;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod session;
pub mod transport;

pub use broadcast::{
    BroadcastGroup, BroadcastStats, Departure, Joined, PeerInfo, RelayMessage, RoomManager,
};
pub use config::{ConfigError, ReconnectPolicy, RelayConfig, SessionConfig, TransportConfig};
pub use persistence::{
    BackendResponse, Credentials, HttpBackend, HttpMethod, PersistError, PersistEvent,
    PersistRequest, PersistenceGateway, RecordBackend,
};
pub use presence::{Participant, ParticipantColor, PresenceTracker};
pub use protocol::{Envelope, Inbound, ProtocolError, Sender};
pub use reconciler::{IgnoreReason, ReconcileOutcome, ReconcileStats, RemoteReconciler};
pub use server::{ConnectTarget, RelayServer, RelayStats};
pub use session::{DocumentSession, SessionError, UpdateOptions};
pub use transport::{
    ConnectionState, EnvelopeSink, SyncTransport, TransportError, TransportEvent, TransportHandle,
};
