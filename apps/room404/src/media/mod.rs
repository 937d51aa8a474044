//! Local capture lifecycle.
//!
//! Tracks outlive negotiation sessions: a partner change never re-opens the
//! device. Enable flags gate sample flow on the tracks themselves, so the
//! peer connection never sees a toggle.

mod device;
pub mod mock;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use webrtc::media::Sample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub use device::SampleTrackDevice;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to capture media was denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("failed to write media sample: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTrackSet {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for MediaTrackSet {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct MediaGate {
    audio_muted: AtomicBool,
    video_muted: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to captured tracks. Clones share the same gate.
#[derive(Clone)]
pub struct LocalMedia {
    stream_id: String,
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    gate: Arc<MediaGate>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalMedia {
    pub fn new(
        stream_id: impl Into<String>,
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio,
            video,
            gate: Arc::new(MediaGate::default()),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if let Some(audio) = &self.audio {
            tracks.push(Arc::clone(audio) as Arc<dyn TrackLocal + Send + Sync>);
        }
        if let Some(video) = &self.video {
            tracks.push(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>);
        }
        tracks
    }

    pub fn is_stopped(&self) -> bool {
        self.gate.stopped.load(Ordering::SeqCst)
    }

    pub fn audio_flowing(&self) -> bool {
        self.audio.is_some() && !self.is_stopped() && !self.gate.audio_muted.load(Ordering::SeqCst)
    }

    pub fn video_flowing(&self) -> bool {
        self.video.is_some() && !self.is_stopped() && !self.gate.video_muted.load(Ordering::SeqCst)
    }

    /// Feeds one captured audio sample. Returns `Ok(false)` when the sample
    /// was dropped because audio is disabled or capture stopped.
    pub async fn write_audio(&self, sample: &Sample) -> Result<bool, MediaError> {
        if !self.audio_flowing() {
            return Ok(false);
        }
        write_sample(self.audio.as_ref(), sample).await
    }

    pub async fn write_video(&self, sample: &Sample) -> Result<bool, MediaError> {
        if !self.video_flowing() {
            return Ok(false);
        }
        write_sample(self.video.as_ref(), sample).await
    }

    fn apply(&self, tracks: MediaTrackSet) {
        self.gate
            .audio_muted
            .store(!tracks.audio_enabled, Ordering::SeqCst);
        self.gate
            .video_muted
            .store(!tracks.video_enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.gate.stopped.store(true, Ordering::SeqCst);
    }
}

async fn write_sample(
    track: Option<&Arc<TrackLocalStaticSample>>,
    sample: &Sample,
) -> Result<bool, MediaError> {
    let Some(track) = track else {
        return Ok(false);
    };
    track
        .write_sample(sample)
        .await
        .map_err(|err| MediaError::Write(err.to_string()))?;
    Ok(true)
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(&self) -> Result<LocalMedia, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaState {
    Idle,
    Acquiring,
    Ready,
    Failed(MediaError),
    Released,
}

/// Result of one `open()` on the device, tagged with the request that
/// started it.
pub struct Acquisition {
    pub request: u64,
    pub result: Result<LocalMedia, MediaError>,
}

#[derive(Debug)]
pub enum AcquireOutcome {
    Ready(LocalMedia),
    Failed(MediaError),
    /// Superseded by `release()` or a newer request; its tracks are stopped.
    Stale,
}

pub struct MediaSourceManager {
    device: Arc<dyn CaptureDevice>,
    state: MediaState,
    request: u64,
    local: Option<LocalMedia>,
    tracks: MediaTrackSet,
}

impl MediaSourceManager {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            state: MediaState::Idle,
            request: 0,
            local: None,
            tracks: MediaTrackSet::default(),
        }
    }

    pub fn state(&self) -> &MediaState {
        &self.state
    }

    pub fn tracks(&self) -> MediaTrackSet {
        self.tracks
    }

    pub fn local(&self) -> Option<&LocalMedia> {
        self.local.as_ref()
    }

    /// Starts an acquisition unless one is running or media is ready. The
    /// returned future owns everything it needs so it can run on its own task.
    pub fn begin_acquire(&mut self) -> Option<BoxFuture<'static, Acquisition>> {
        if matches!(self.state, MediaState::Acquiring | MediaState::Ready) {
            return None;
        }
        self.request += 1;
        self.state = MediaState::Acquiring;
        let request = self.request;
        let device = Arc::clone(&self.device);
        tracing::debug!(target = "room404::media", request, "acquiring local media");
        Some(
            async move {
                let result = device.open().await;
                Acquisition { request, result }
            }
            .boxed(),
        )
    }

    pub fn complete_acquire(&mut self, acquisition: Acquisition) -> AcquireOutcome {
        let current =
            acquisition.request == self.request && self.state == MediaState::Acquiring;
        if !current {
            tracing::debug!(
                target = "room404::media",
                request = acquisition.request,
                current = self.request,
                "discarding stale media acquisition"
            );
            if let Ok(media) = acquisition.result {
                media.stop();
            }
            return AcquireOutcome::Stale;
        }
        match acquisition.result {
            Ok(media) => {
                media.apply(self.tracks);
                tracing::info!(
                    target = "room404::media",
                    stream_id = %media.stream_id(),
                    audio = media.has_audio(),
                    video = media.has_video(),
                    "local media ready"
                );
                self.state = MediaState::Ready;
                self.local = Some(media.clone());
                AcquireOutcome::Ready(media)
            }
            Err(err) => {
                tracing::warn!(target = "room404::media", error = %err, "local media unavailable; continuing receive-only");
                self.state = MediaState::Failed(err.clone());
                AcquireOutcome::Failed(err)
            }
        }
    }

    /// Acquires inline. Returns the existing media when already ready.
    pub async fn acquire(&mut self) -> Result<LocalMedia, MediaError> {
        if let Some(media) = &self.local {
            return Ok(media.clone());
        }
        let Some(pending) = self.begin_acquire() else {
            return Err(MediaError::DeviceUnavailable(
                "acquisition already in progress".into(),
            ));
        };
        match self.complete_acquire(pending.await) {
            AcquireOutcome::Ready(media) => Ok(media),
            AcquireOutcome::Failed(err) => Err(err),
            AcquireOutcome::Stale => Err(MediaError::DeviceUnavailable(
                "acquisition superseded".into(),
            )),
        }
    }

    /// Stops every track and cancels any acquisition in flight. Idempotent.
    pub fn release(&mut self) {
        if matches!(self.state, MediaState::Idle | MediaState::Released) && self.local.is_none() {
            return;
        }
        // Bumping the request id turns an in-flight acquisition stale.
        self.request += 1;
        if let Some(media) = self.local.take() {
            media.stop();
            tracing::debug!(target = "room404::media", stream_id = %media.stream_id(), "local media released");
        }
        self.state = MediaState::Released;
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.tracks.audio_enabled = enabled;
        if let Some(media) = &self.local {
            media.apply(self.tracks);
        }
        tracing::debug!(target = "room404::media", enabled, "audio toggled");
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.tracks.video_enabled = enabled;
        if let Some(media) = &self.local {
            media.apply(self.tracks);
        }
        tracing::debug!(target = "room404::media", enabled, "video toggled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{DeniedDevice, GatedDevice};
    use bytes::Bytes;
    use std::time::Duration;

    fn sample() -> Sample {
        Sample {
            data: Bytes::from_static(&[0u8; 16]),
            duration: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn toggles_gate_samples_without_reacquiring() {
        let (device, gate) = GatedDevice::new();
        gate.open();
        let opens = device.opens();
        let mut manager = MediaSourceManager::new(Arc::new(device));
        let media = manager.acquire().await.unwrap();
        assert!(media.audio_flowing());

        manager.set_audio_enabled(false);
        assert!(!media.audio_flowing());
        assert!(!media.write_audio(&sample()).await.unwrap());
        assert!(media.video_flowing());

        manager.set_audio_enabled(true);
        manager.set_video_enabled(false);
        assert!(media.audio_flowing());
        assert!(!media.video_flowing());
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.tracks(), MediaTrackSet {
            audio_enabled: true,
            video_enabled: false,
        });
    }

    #[tokio::test]
    async fn toggle_before_ready_is_applied_on_arrival() {
        let (device, gate) = GatedDevice::new();
        let mut manager = MediaSourceManager::new(Arc::new(device));
        let pending = manager.begin_acquire().unwrap();
        manager.set_video_enabled(false);
        gate.open();
        match manager.complete_acquire(pending.await) {
            AcquireOutcome::Ready(media) => {
                assert!(media.audio_flowing());
                assert!(!media.video_flowing());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_during_acquire_discards_late_tracks() {
        let (device, gate) = GatedDevice::new();
        let mut manager = MediaSourceManager::new(Arc::new(device));
        let pending = manager.begin_acquire().unwrap();
        manager.release();
        manager.release();
        gate.open();
        assert!(matches!(
            manager.complete_acquire(pending.await),
            AcquireOutcome::Stale
        ));
        assert!(manager.local().is_none());
        assert_eq!(manager.state(), &MediaState::Released);
    }

    #[tokio::test]
    async fn denial_leaves_manager_failed() {
        let mut manager = MediaSourceManager::new(Arc::new(DeniedDevice::default()));
        assert_eq!(manager.acquire().await.unwrap_err(), MediaError::PermissionDenied);
        assert_eq!(
            manager.state(),
            &MediaState::Failed(MediaError::PermissionDenied)
        );
        assert!(manager.begin_acquire().is_some());
    }

    #[tokio::test]
    async fn release_stops_tracks() {
        let (device, gate) = GatedDevice::new();
        gate.open();
        let mut manager = MediaSourceManager::new(Arc::new(device));
        let media = manager.acquire().await.unwrap();
        manager.release();
        assert!(media.is_stopped());
        assert!(!media.write_video(&sample()).await.unwrap());
    }
}
