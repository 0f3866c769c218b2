//! Peer connection abstraction used by the call engine

use crate::error::Result;
use crate::media::MediaTrack;
use crate::models::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications raised by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local network candidate was discovered (trickle ICE).
    IceCandidate(IceCandidate),
    RemoteTrack(Arc<MediaTrack>),
    StateChanged(PeerState),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Must be a no-op on an already closed connection.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a fresh connection reporting its events on `events`.
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>>;
}
