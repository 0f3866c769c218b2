//! Local media acquisition and track handles

use crate::error::MediaError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A single audio or video track. Disabling keeps the track attached but
/// silent/black; stopping releases it for good.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self::with_id(format!("{}-{}", kind, uuid::Uuid::new_v4()), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Idempotent.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            log::debug!("Stopped {} track {}", self.kind, self.id);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn add_track(&mut self, track: Arc<MediaTrack>) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    /// Enable or disable every track of one kind in place.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn has_live_tracks(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio is always requested for a call; video only when asked for.
    pub fn for_call(video: bool) -> Self {
        Self { audio: true, video }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaError>;
}

/// Device registry for the local machine. Tracks it hands out are handles
/// for a capture pipeline to feed.
#[derive(Debug, Clone)]
pub struct LocalMediaDevices {
    has_microphone: bool,
    has_camera: bool,
    permission_granted: bool,
}

impl Default for LocalMediaDevices {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl LocalMediaDevices {
    pub fn new(has_microphone: bool, has_camera: bool) -> Self {
        Self {
            has_microphone,
            has_camera,
            permission_granted: true,
        }
    }

    pub fn deny_permission(mut self) -> Self {
        self.permission_granted = false;
        self
    }
}

#[async_trait]
impl MediaDevices for LocalMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaError> {
        if !self.permission_granted {
            return Err(MediaError::PermissionDenied(
                "camera and microphone".into(),
            ));
        }
        if constraints.audio && !self.has_microphone {
            return Err(MediaError::DeviceNotFound("microphone".into()));
        }
        if constraints.video && !self.has_camera {
            return Err(MediaError::DeviceNotFound("camera".into()));
        }

        let mut stream = MediaStream::default();
        if constraints.audio {
            stream.add_track(Arc::new(MediaTrack::new(TrackKind::Audio)));
        }
        if constraints.video {
            stream.add_track(Arc::new(MediaTrack::new(TrackKind::Video)));
        }
        log::debug!(
            "Acquired local media (audio: {}, video: {})",
            constraints.audio,
            constraints.video
        );
        Ok(stream)
    }
}
