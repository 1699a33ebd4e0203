//! Live relay handshake contract
//!
//! The WebRTC transport itself lives outside this crate. Devices connect to
//! the relay URL handed out on join, publish their acquired tracks and, for
//! reviewers, subscribe to a participant's tracks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{DeviceRole, StreamKind};

/// A media track as announced to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub role: DeviceRole,
    pub kind: StreamKind,
    pub track_id: String,
}

#[async_trait]
pub trait LiveRelay: Send + Sync {
    async fn connect(
        &self,
        relay_url: &str,
        session_id: &str,
        credential: &str,
    ) -> Result<Box<dyn RoomHandle>>;
}

#[async_trait]
pub trait RoomHandle: Send + Sync {
    async fn publish(&self, track: TrackDescriptor) -> Result<()>;

    /// Tracks currently published by a participant role
    async fn subscribe(&self, participant: DeviceRole) -> Result<Vec<TrackDescriptor>>;

    async fn leave(&self) -> Result<()>;
}
