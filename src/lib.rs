//! roomcast — an embeddable real-time conferencing core.
//!
//! Hosts wire a transport and a media SFU capability around the
//! [`signaling::SignalingHandler`]; the crate owns rooms, participants,
//! track routing, sessions, network-quality tracking and reconnection.

pub mod config;
pub mod error;
pub mod events;
pub mod id_types;
pub mod logging;
pub mod participant;
pub mod quality;
pub mod reconnect;
pub mod room;
pub mod room_manager;
pub mod session;
pub mod sfu;
pub mod sfu_graph;
pub mod signaling;
pub mod subscription;
pub mod token;
pub mod track;

pub use config::EngineConfig;
pub use error::{CoreError, ErrorKind};
pub use events::{EventBus, EventType, RoomEvent};
pub use id_types::{ParticipantId, RoomId, TrackId, UserId};
pub use participant::{Grants, Participant, ParticipantState};
pub use room::{Room, RoomOptions};
pub use room_manager::{JoinRoomRequest, RoomManager};
pub use sfu::{MediaSfu, NullSfu, Publisher, Subscriber};
pub use signaling::{SignalFrame, SignalingHandler};
pub use token::{AccessToken, TokenVerifier};

#[cfg(test)]
mod tests;
