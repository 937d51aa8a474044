use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{CaptureDevice, LocalMedia, MediaError};

/// Sample-fed tracks: the host pushes encoded Opus/VP8 frames through
/// [`LocalMedia::write_audio`] and [`LocalMedia::write_video`].
#[derive(Debug, Clone)]
pub struct SampleTrackDevice {
    audio: bool,
    video: bool,
}

impl Default for SampleTrackDevice {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl SampleTrackDevice {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }
}

#[async_trait]
impl CaptureDevice for SampleTrackDevice {
    async fn open(&self) -> Result<LocalMedia, MediaError> {
        if !self.audio && !self.video {
            return Err(MediaError::DeviceUnavailable(
                "no capture kinds configured".into(),
            ));
        }
        let stream_id = format!("room404-{}", Uuid::new_v4());
        let audio = self.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                stream_id.clone(),
            ))
        });
        let video = self.video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                "video".to_owned(),
                stream_id.clone(),
            ))
        });
        tracing::debug!(target = "room404::media", %stream_id, audio = self.audio, video = self.video, "sample tracks created");
        Ok(LocalMedia::new(stream_id, audio, video))
    }
}
