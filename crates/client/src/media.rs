// ============================
// meshroom-client/src/media.rs
// ============================
//! Local capture: progressive acquisition and the per-kind outgoing source.
use crate::error::MediaAccessError;
use crate::transport::{LocalTrack, TrackKind, TrackSource};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Platform capture devices
#[async_trait]
pub trait MediaDevices: Send {
    async fn get_user_media(&mut self, constraints: MediaConstraints) -> Result<Vec<LocalTrack>, MediaAccessError>;

    async fn get_display_media(&mut self) -> Result<LocalTrack, MediaAccessError>;
}

/// What capture ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaProfile {
    Full,
    AudioOnly,
    /// Join with inbound media only
    ReceiveOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    profile: MediaProfile,
    microphone: Option<LocalTrack>,
    camera: Option<LocalTrack>,
    screen: Option<LocalTrack>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::receive_only()
    }
}

impl LocalMedia {
    pub fn receive_only() -> Self {
        Self {
            profile: MediaProfile::ReceiveOnly,
            microphone: None,
            camera: None,
            screen: None,
            audio_enabled: false,
            video_enabled: false,
        }
    }

    /// Build from captured tracks, deriving the profile
    pub fn from_tracks(tracks: Vec<LocalTrack>) -> Self {
        let mut media = Self::receive_only();
        for track in tracks {
            match track.kind {
                TrackKind::Audio if media.microphone.is_none() => media.microphone = Some(track),
                TrackKind::Video if media.camera.is_none() => media.camera = Some(track),
                _ => {},
            }
        }
        media.profile = match (&media.microphone, &media.camera) {
            (Some(_), Some(_)) => MediaProfile::Full,
            (Some(_), None) => MediaProfile::AudioOnly,
            // video without audio is sent as-is, there is no profile for it
            (None, Some(_)) => MediaProfile::Full,
            (None, None) => MediaProfile::ReceiveOnly,
        };
        media.audio_enabled = media.microphone.is_some();
        media.video_enabled = media.camera.is_some();
        media
    }

    pub fn profile(&self) -> MediaProfile {
        self.profile
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Returns false if there is no microphone to unmute
    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        if enabled && self.microphone.is_none() {
            return false;
        }
        self.audio_enabled = enabled;
        true
    }

    /// Returns false if there is no camera to turn on
    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        if enabled && self.camera.is_none() {
            return false;
        }
        self.video_enabled = enabled;
        true
    }

    pub fn start_screen(&mut self, track: LocalTrack) {
        self.screen = Some(track);
    }

    pub fn stop_screen(&mut self) -> Option<LocalTrack> {
        self.screen.take()
    }

    /// Source the sender for `kind` should carry right now
    pub fn outgoing_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        match kind {
            TrackKind::Audio => self.microphone.clone().filter(|_| self.audio_enabled),
            TrackKind::Video => match &self.screen {
                Some(screen) => Some(screen.clone()),
                None => self.camera.clone().filter(|_| self.video_enabled),
            },
        }
    }

    /// Release every track
    pub fn stop(&mut self) {
        *self = Self::receive_only();
    }
}

/// Full media, then audio only, then nothing. Each request is bounded by
/// `timeout`; failures only downgrade.
pub async fn acquire_local_media<D: MediaDevices>(devices: &mut D, timeout: Duration) -> LocalMedia {
    let attempts = [
        MediaConstraints { audio: true, video: true },
        MediaConstraints { audio: true, video: false },
    ];

    for constraints in attempts {
        let result = tokio::time::timeout(timeout, devices.get_user_media(constraints))
            .await
            .unwrap_or(Err(MediaAccessError::Timeout));
        match result {
            Ok(tracks) if !tracks.is_empty() => {
                let media = LocalMedia::from_tracks(tracks);
                info!(profile = ?media.profile(), "local media acquired");
                return media;
            },
            Ok(_) => warn!(?constraints, "no tracks returned"),
            Err(e) => warn!(?constraints, "media request failed: {e}"),
        }
    }

    warn!("continuing without outbound media");
    LocalMedia::receive_only()
}

/// Ask the platform for a screen or window to share, bounded by `timeout`
pub async fn acquire_screen<D: MediaDevices>(devices: &mut D, timeout: Duration) -> Result<LocalTrack, MediaAccessError> {
    let track = tokio::time::timeout(timeout, devices.get_display_media())
        .await
        .unwrap_or(Err(MediaAccessError::Timeout))?;
    if track.kind != TrackKind::Video {
        return Err(MediaAccessError::Unavailable("screen"));
    }
    info!(track_id = %track.id, "screen capture acquired");
    Ok(track)
}
