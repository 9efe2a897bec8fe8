//! Local capture tracks and their fan-out to peer links.
//!
//! At most one audio and one video track go out on each peer link. Which
//! video track that is follows [`VideoSource`]:
//!
//! | state        | camera | screen | on the wire |
//! |--------------|--------|--------|-------------|
//! | `None`       |        |        |             |
//! | `CameraOnly` | yes    |        | camera      |
//! | `ScreenOnly` |        | yes    | screen      |
//! | `BothCamera` | yes    | yes    | camera      |
//! | `BothScreen` | yes    | yes    | screen      |
//!
//! Moving between "nothing on the wire" and "something on the wire" adds or
//! removes the video sender and renegotiates every link. Moving between
//! camera and screen replaces the track in place.
//!
//! Device acquisition happens before any of these methods are called: they
//! take an already-captured track and only decide where it goes.

use async_trait::async_trait;
use parley_common::signal::ClientSignal;
use parley_common::{MediaNotice, ParticipantId, TrackToggleState};

use crate::error::{ClientError, Result};
use crate::media::{DeviceKind, TrackHandle, TrackKind};
use crate::SignalOutbox;

/// Where outbound track changes are applied: every peer link of the pool.
#[async_trait]
pub trait TrackSink: Send {
    /// Start sending `track` on every link (renegotiates).
    async fn add_track(&mut self, track: &TrackHandle);
    /// Swap the sent track of `kind` on every link without renegotiating.
    /// Links that fail the swap are closed; the first failure is returned.
    async fn replace_track(&mut self, kind: TrackKind, track: &TrackHandle) -> Result<()>;
    /// Stop sending `kind` on every link (renegotiates).
    async fn remove_track(&mut self, kind: TrackKind);
    /// Remotes of the current links.
    fn remotes(&self) -> Vec<ParticipantId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoSource {
    #[default]
    None,
    CameraOnly,
    ScreenOnly,
    /// Camera and screen captured, camera on the wire.
    BothCamera,
    /// Camera and screen captured, screen on the wire.
    BothScreen,
}

impl VideoSource {
    pub fn camera_enabled(self) -> bool {
        matches!(self, Self::CameraOnly | Self::BothCamera | Self::BothScreen)
    }

    pub fn screen_enabled(self) -> bool {
        matches!(self, Self::ScreenOnly | Self::BothCamera | Self::BothScreen)
    }

    /// The device whose track is sent.
    pub fn on_wire(self) -> Option<DeviceKind> {
        match self {
            Self::None => None,
            Self::CameraOnly | Self::BothCamera => Some(DeviceKind::Camera),
            Self::ScreenOnly | Self::BothScreen => Some(DeviceKind::Screen),
        }
    }

    pub fn showing_screen(self) -> bool {
        self == Self::BothScreen
    }

    fn with_camera(self) -> Self {
        match self {
            Self::None => Self::CameraOnly,
            Self::ScreenOnly => Self::BothScreen,
            other => other,
        }
    }

    fn without_camera(self) -> Self {
        match self {
            Self::CameraOnly => Self::None,
            Self::BothCamera | Self::BothScreen => Self::ScreenOnly,
            other => other,
        }
    }

    /// Enabling screen share always puts the screen on the wire.
    fn with_screen(self) -> Self {
        match self {
            Self::None => Self::ScreenOnly,
            Self::CameraOnly | Self::BothCamera => Self::BothScreen,
            other => other,
        }
    }

    fn without_screen(self) -> Self {
        match self {
            Self::ScreenOnly => Self::None,
            Self::BothCamera | Self::BothScreen => Self::CameraOnly,
            other => other,
        }
    }
}

pub struct TrackManager {
    microphone: Option<TrackHandle>,
    muted: bool,
    camera: Option<TrackHandle>,
    screen: Option<TrackHandle>,
    video: VideoSource,
    outbox: SignalOutbox,
}

impl TrackManager {
    pub fn new(outbox: SignalOutbox) -> Self {
        Self {
            microphone: None,
            muted: false,
            camera: None,
            screen: None,
            video: VideoSource::None,
            outbox,
        }
    }

    pub fn video_source(&self) -> VideoSource {
        self.video
    }

    pub fn microphone(&self) -> Option<&TrackHandle> {
        self.microphone.as_ref()
    }

    pub fn camera(&self) -> Option<&TrackHandle> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&TrackHandle> {
        self.screen.as_ref()
    }

    /// Tracks a newly created peer link must send.
    pub fn outbound_tracks(&self) -> Vec<TrackHandle> {
        let video = match self.video.on_wire() {
            Some(DeviceKind::Camera) => self.camera.clone(),
            Some(DeviceKind::Screen) => self.screen.clone(),
            _ => None,
        };
        self.microphone.iter().cloned().chain(video).collect()
    }

    pub fn toggle_state(&self) -> TrackToggleState {
        TrackToggleState {
            muted: self.muted || self.microphone.is_none(),
            video_enabled: self.video.camera_enabled(),
            screen_sharing: self.video.screen_enabled(),
            showing_screen: self.video.showing_screen(),
        }
    }

    // === Audio ===

    pub async fn enable_audio<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        if self.microphone.is_some() {
            return self.swap_microphone(track, sink).await;
        }
        track.set_enabled(true);
        self.muted = false;
        sink.add_track(&track).await;
        tracing::debug!(track = track.id(), "Microphone enabled");
        self.microphone = Some(track);
        self.notify(MediaNotice::Mute { value: false });
        Ok(())
    }

    pub async fn disable_audio<S: TrackSink + ?Sized>(&mut self, sink: &mut S) {
        let Some(track) = self.microphone.take() else {
            return;
        };
        sink.remove_track(TrackKind::Audio).await;
        track.stop();
        self.muted = false;
        self.notify(MediaNotice::Mute { value: true });
    }

    /// Mute or unmute the live microphone track. The track stays attached,
    /// so no link renegotiates.
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        let track = self.microphone.as_ref().ok_or(ClientError::SourceUnavailable)?;
        track.set_enabled(!muted);
        self.muted = muted;
        self.notify(MediaNotice::Mute { value: muted });
        Ok(())
    }

    /// Move to a different microphone.
    pub async fn set_microphone<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        if self.microphone.is_some() {
            self.swap_microphone(track, sink).await
        } else {
            self.enable_audio(track, sink).await
        }
    }

    async fn swap_microphone<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        track.set_enabled(!self.muted);
        swap(&mut self.microphone, track, TrackKind::Audio, sink).await
    }

    // === Camera ===

    pub async fn enable_video<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        if self.camera.is_some() {
            return self.swap_camera(track, sink).await;
        }
        if self.video == VideoSource::None {
            sink.add_track(&track).await;
        }
        self.camera = Some(track);
        self.video = self.video.with_camera();
        self.notify(MediaNotice::Video { value: true });
        if self.video.showing_screen() {
            self.notify(MediaNotice::VideoSource {
                showing_screen: true,
            });
        }
        Ok(())
    }

    pub async fn disable_video<S: TrackSink + ?Sized>(&mut self, sink: &mut S) {
        let Some(track) = self.camera.take() else {
            return;
        };
        match self.video {
            VideoSource::CameraOnly => sink.remove_track(TrackKind::Video).await,
            VideoSource::BothCamera => {
                if let Some(screen) = &self.screen {
                    if let Err(e) = sink.replace_track(TrackKind::Video, screen).await {
                        tracing::warn!("Falling back to screen track failed on a link: {e}");
                    }
                }
            }
            _ => {}
        }
        track.stop();
        self.video = self.video.without_camera();
        self.notify(MediaNotice::Video { value: false });
    }

    /// Move to a different camera.
    pub async fn set_camera<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        if self.camera.is_some() {
            self.swap_camera(track, sink).await
        } else {
            self.enable_video(track, sink).await
        }
    }

    async fn swap_camera<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        if self.video.on_wire() == Some(DeviceKind::Camera) {
            return swap(&mut self.camera, track, TrackKind::Video, sink).await;
        }
        if let Some(old) = self.camera.replace(track) {
            old.stop();
        }
        Ok(())
    }

    // === Screen ===

    pub async fn enable_screen_share<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        if self.screen.is_some() {
            return self.swap_screen(track, sink).await;
        }
        match self.video {
            VideoSource::None => sink.add_track(&track).await,
            VideoSource::CameraOnly => {
                if let Err(e) = sink.replace_track(TrackKind::Video, &track).await {
                    tracing::warn!("Switching a link to the screen track failed: {e}");
                }
            }
            _ => {}
        }
        self.screen = Some(track);
        self.video = self.video.with_screen();
        self.notify(MediaNotice::ScreenShare { value: true });
        if self.video.camera_enabled() {
            self.notify(MediaNotice::VideoSource {
                showing_screen: true,
            });
        }
        Ok(())
    }

    pub async fn disable_screen_share<S: TrackSink + ?Sized>(&mut self, sink: &mut S) {
        let Some(track) = self.screen.take() else {
            return;
        };
        match self.video {
            VideoSource::ScreenOnly => sink.remove_track(TrackKind::Video).await,
            VideoSource::BothScreen => {
                if let Some(camera) = &self.camera {
                    if let Err(e) = sink.replace_track(TrackKind::Video, camera).await {
                        tracing::warn!("Falling back to camera track failed on a link: {e}");
                    }
                }
            }
            _ => {}
        }
        track.stop();
        self.video = self.video.without_screen();
        self.notify(MediaNotice::ScreenShare { value: false });
    }

    async fn swap_screen<S: TrackSink + ?Sized>(&mut self, track: TrackHandle, sink: &mut S) -> Result<()> {
        if self.video.on_wire() == Some(DeviceKind::Screen) {
            return swap(&mut self.screen, track, TrackKind::Video, sink).await;
        }
        if let Some(old) = self.screen.replace(track) {
            old.stop();
        }
        Ok(())
    }

    /// With camera and screen both captured, choose which one is sent.
    ///
    /// The track is replaced in place on every link; remotes learn about it
    /// from a `video_source_changed` notice to the context and a direct
    /// `switch_video_source` to every linked peer.
    pub async fn switch_video_source<S: TrackSink + ?Sized>(&mut self, show_screen: bool, sink: &mut S) -> Result<()> {
        let (Some(camera), Some(screen)) = (&self.camera, &self.screen) else {
            return Err(ClientError::SourceUnavailable);
        };
        let target = if show_screen {
            VideoSource::BothScreen
        } else {
            VideoSource::BothCamera
        };
        if target == self.video {
            return Ok(());
        }

        let track = if show_screen { screen.clone() } else { camera.clone() };
        if let Err(e) = sink.replace_track(TrackKind::Video, &track).await {
            tracing::warn!("Switching video source failed on a link: {e}");
        }
        self.video = target;

        self.notify(MediaNotice::VideoSource {
            showing_screen: show_screen,
        });
        for remote in sink.remotes() {
            let _ = self.outbox.send(ClientSignal::SwitchVideoSource {
                target: remote,
                show_screen,
            });
        }
        Ok(())
    }

    /// The capture backend ended a track on its own (device unplugged, or the
    /// OS "stop sharing" control). Returns the device that went away.
    pub async fn on_track_ended<S: TrackSink + ?Sized>(&mut self, track_id: &str, sink: &mut S) -> Option<DeviceKind> {
        let is = |track: &Option<TrackHandle>| track.as_ref().is_some_and(|t| t.id() == track_id);

        if is(&self.screen) {
            tracing::info!("Screen share stopped by the system");
            self.disable_screen_share(sink).await;
            Some(DeviceKind::Screen)
        } else if is(&self.camera) {
            self.disable_video(sink).await;
            Some(DeviceKind::Camera)
        } else if is(&self.microphone) {
            self.disable_audio(sink).await;
            Some(DeviceKind::Microphone)
        } else {
            None
        }
    }

    /// Publish the full toggle state to a context just entered. Notices
    /// sent while outside voice reached nobody.
    pub fn announce(&self) {
        let state = self.toggle_state();
        self.notify(MediaNotice::Mute { value: state.muted });
        self.notify(MediaNotice::Video {
            value: state.video_enabled,
        });
        self.notify(MediaNotice::ScreenShare {
            value: state.screen_sharing,
        });
        if state.video_enabled && state.screen_sharing {
            self.notify(MediaNotice::VideoSource {
                showing_screen: state.showing_screen,
            });
        }
    }

    /// Stop every capture without touching links (they are being torn down).
    pub fn release_all(&mut self) {
        for track in [self.microphone.take(), self.camera.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
        self.video = VideoSource::None;
        self.muted = false;
    }

    fn notify(&self, notice: MediaNotice) {
        let _ = self.outbox.send(ClientSignal::from_notice(notice));
    }
}

/// Put `new` on the wire in place of the track in `slot`. The old track is
/// released only once every link took the new one; on failure the surviving
/// links go back to the old track and `new` is released instead.
async fn swap<S: TrackSink + ?Sized>(
    slot: &mut Option<TrackHandle>,
    new: TrackHandle,
    kind: TrackKind,
    sink: &mut S,
) -> Result<()> {
    match sink.replace_track(kind, &new).await {
        Ok(()) => {
            if let Some(old) = slot.replace(new) {
                old.stop();
            }
            Ok(())
        }
        Err(e) => {
            if let Some(old) = slot.as_ref() {
                let _ = sink.replace_track(kind, old).await;
            }
            new.stop();
            Err(e)
        }
    }
}
