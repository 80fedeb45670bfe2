//! Local and remote media ownership for a call session.
//!
//! The [`MediaSessionManager`] is the sole owner of raw media tracks.
//! Other components (coordinator, negotiator) receive only cloned
//! [`MediaTrackSet`] handles and drive enablement through the manager.
//! Capture hardware itself is an external capability behind
//! [`MediaDevices`].

use async_trait::async_trait;
use log::{debug, warn};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    AccessDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Kind of an individual media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// An opaque media track handle.
///
/// Enabling and disabling a track never requires renegotiation: the
/// track stays attached to the peer connection and is merely muted.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Stop the track and release any capture resource behind it.
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

/// A set of track handles, local or remote.
///
/// Cloning is cheap: tracks are shared `Arc` handles.
#[derive(Clone, Default)]
pub struct MediaTrackSet {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaTrackSet {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Flip enablement for every track of the given kind.
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
}

impl fmt::Debug for MediaTrackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for track in &self.tracks {
            list.entry(&format_args!("{:?} {}", track.kind(), track.id()));
        }
        list.finish()
    }
}

/// Capture capability: camera/microphone access.
///
/// Opening activates hardware; a denied permission or missing device
/// surfaces as a typed [`MediaError`] so the coordinator can end the
/// call before it ever reaches Ongoing.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, with_video: bool) -> Result<MediaTrackSet, MediaError>;
}

/// Owns the local and remote track sets for one call session.
pub struct MediaSessionManager {
    devices: Arc<dyn MediaDevices>,
    local: Option<MediaTrackSet>,
    remote: Option<MediaTrackSet>,
    audio_enabled: bool,
    video_enabled: bool,
    released: bool,
}

impl MediaSessionManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: None,
            remote: None,
            audio_enabled: true,
            video_enabled: true,
            released: false,
        }
    }

    /// Acquire local capture media and adopt it.
    ///
    /// The coordinator prefers to run [`MediaDevices::open`] off the
    /// event loop and hand the result to [`adopt_local`](Self::adopt_local);
    /// this convenience exists for embedders driving the manager directly.
    pub async fn acquire_local(&mut self, with_video: bool) -> Result<MediaTrackSet, MediaError> {
        let set = self.devices.open(with_video).await?;
        self.adopt_local(set.clone());
        Ok(set)
    }

    /// Take ownership of an already-opened local track set.
    pub fn adopt_local(&mut self, set: MediaTrackSet) {
        if self.released {
            // Acquisition raced a teardown; stop the hardware right away.
            warn!("Adopting local media after release, stopping tracks");
            set.stop_all();
            return;
        }
        set.set_enabled(TrackKind::Audio, self.audio_enabled);
        set.set_enabled(TrackKind::Video, self.video_enabled);
        debug!("Adopted local media: {:?}", set);
        self.local = Some(set);
    }

    /// Called when the negotiator surfaces the peer's media.
    pub fn attach_remote(&mut self, set: MediaTrackSet) {
        if self.released {
            warn!("Ignoring remote media after release");
            return;
        }
        debug!("Attached remote media: {:?}", set);
        match &mut self.remote {
            // Remote tracks arrive one ontrack event at a time; merge.
            Some(existing) => existing.tracks.extend(set.tracks),
            None => self.remote = Some(set),
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        if let Some(local) = &self.local {
            local.set_enabled(TrackKind::Audio, enabled);
        }
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        if let Some(local) = &self.local {
            local.set_enabled(TrackKind::Video, enabled);
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn local(&self) -> Option<MediaTrackSet> {
        self.local.clone()
    }

    pub fn remote(&self) -> Option<MediaTrackSet> {
        self.remote.clone()
    }

    /// Stop every local and remote track and release the hardware.
    ///
    /// Idempotent; safe to call on every exit path.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(local) = self.local.take() {
            local.stop_all();
        }
        if let Some(remote) = self.remote.take() {
            remote.stop_all();
        }
        debug!("Released media session");
    }
}

impl Drop for MediaSessionManager {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct FakeTrack {
        id: String,
        kind: TrackKind,
        enabled: AtomicBool,
        stopped: AtomicBool,
    }

    impl FakeTrack {
        pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            })
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    impl MediaTrack for FakeTrack {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> TrackKind {
            self.kind
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Capture double that records every opened track set.
    pub struct FakeDevices {
        pub fail_with: Mutex<Option<MediaError>>,
        pub opened: Mutex<Vec<MediaTrackSet>>,
    }

    impl FakeDevices {
        pub fn working() -> Arc<Self> {
            Arc::new(Self {
                fail_with: Mutex::new(None),
                opened: Mutex::new(Vec::new()),
            })
        }

        pub fn denied() -> Arc<Self> {
            Arc::new(Self {
                fail_with: Mutex::new(Some(MediaError::AccessDenied("permission denied".into()))),
                opened: Mutex::new(Vec::new()),
            })
        }

        pub fn last_opened(&self) -> Option<MediaTrackSet> {
            self.opened.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn open(&self, with_video: bool) -> Result<MediaTrackSet, MediaError> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            let mut tracks: Vec<Arc<dyn MediaTrack>> =
                vec![FakeTrack::new("mic0", TrackKind::Audio)];
            if with_video {
                tracks.push(FakeTrack::new("cam0", TrackKind::Video));
            }
            let set = MediaTrackSet::new(tracks);
            self.opened.lock().unwrap().push(set.clone());
            Ok(set)
        }
    }
}
