//! Real-time room hub: WebSocket sessions, the hub actor that owns room
//! membership, and a small HTTP surface around them.

pub mod connection;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod hub;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use connection::{ConnectionHandle, Frame, Liveness, OutboundQueue, OutboundReceiver, PushError};
pub use error::{HandshakeError, ServerError};
pub use hub::{Broadcast, Collaborators, Hub, HubHandle, HubStats};
pub use registry::{RoomRegistry, RoomSummary};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{Identity, LoopExit, SessionConfig};
pub use shutdown::ShutdownCoordinator;
