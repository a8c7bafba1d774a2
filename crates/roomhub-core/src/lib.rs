pub mod collaborators;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use collaborators::{MessageFilter, MessageStore, PresenceCache, StoredMessage};
pub use envelope::{ChatMessage, Envelope, Event, EventKind, PresenceUpdate, TypingNotice, UserSummary};
pub use errors::{CollaboratorError, FrameError};
pub use ids::{ConnectionId, MessageId, RoomId, UserId};
