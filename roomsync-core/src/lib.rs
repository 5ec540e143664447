//! Room state synchronization
//!
//! Mirrors a native, event-driven media session into a consistent tree of
//! rooms, participants, publications and tracks that a UI layer can observe,
//! and manages the exclusive attachment of video surfaces to tracks.
//!
//! ## Architecture
//!
//! - **`Room`**: one session; connection state machine and event dispatch
//! - **`Participant`**: local or remote member with its publications by kind
//! - **`RemoteTrackPublication` / `LocalTrackPublication`**: published track metadata
//! - **`Track`**: one audio, video or data stream
//! - **`VideoSurface`**: rendering surface bound to at most one track
//! - **`MediaEngine`**: the seam to the native engine
//!
//! Native events are applied in delivery order by a single consumer per room.
//! Commands resolve only once their confirming event has been applied.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomsync_core::{ConnectOptions, Room, SessionConfig, Track, TrackKind};
//!
//! let room = Room::connect(engine.clone(), &ConnectOptions::default(), SessionConfig::default()).await?;
//! let camera = Track::create_local(engine, "camera", TrackKind::Video, true)?;
//! let publication = room.local_participant().unwrap().publish(&camera).await?;
//! let mut snapshots = room.subscribe();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod participant;
pub mod publication;
pub mod reconcile;
pub mod room;
pub mod sink;
pub mod snapshot;
pub mod track;
pub mod types;

pub use config::{Config, ConnectOptions, LoggingConfig, SessionConfig};
pub use engine::{EngineError, MediaEngine, SessionHandle, TrackRef};
pub use error::{Error, ErrorClass, Result};
pub use event::{ParticipantEvent, ParticipantInfo, PublicationInfo, SessionEvent};
pub use participant::{LocalParticipant, Participant, RemoteParticipant};
pub use publication::{LocalTrackPublication, Publication, RemoteTrackPublication, Subscription};
pub use reconcile::{Reconciler, RoomState, SessionModel};
pub use room::{LocalParticipantHandle, Room};
pub use sink::{FrameRenderer, ScaleType, SinkId, VideoSurface};
pub use snapshot::{ParticipantSnapshot, PublicationSnapshot, RoomSnapshot, SubscriptionState};
pub use track::{Track, TrackOrigin, TrackSnapshot, TrackState, VideoFrame, WeakTrack};
pub use types::{NetworkQualityLevel, ParticipantSid, RoomSid, TrackKind, TrackPriority, TrackSid};
