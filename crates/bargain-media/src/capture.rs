use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Audio processing requested from the capture device. All three default to
/// on because negotiation calls are voice-only and typically made from noisy
/// environments (markets, vehicles, processing floors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("capture backend error: {0}")]
    Backend(String),
}

impl CaptureError {
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }
}

#[derive(Debug)]
struct TrackInner {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to one local media track. Clones share the underlying track, so a
/// `stop()` through any clone is visible to all of them.
#[derive(Debug, Clone)]
pub struct TrackHandle {
    inner: Arc<TrackInner>,
}

impl TrackHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackInner {
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute/unmute. Local-only; does not renegotiate anything.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Release the underlying device. Irreversible.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

impl Default for TrackHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of local tracks one acquisition produced.
#[derive(Debug, Clone, Default)]
pub struct CaptureStream {
    tracks: Vec<TrackHandle>,
}

impl CaptureStream {
    pub fn new(tracks: Vec<TrackHandle>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[TrackHandle] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for t in &self.tracks {
            t.stop();
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        for t in &self.tracks {
            t.set_enabled(enabled);
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.tracks.iter().any(|t| t.is_enabled())
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }
}

/// Seam for acquiring local audio. Implementations may block while the host
/// prompts the user for microphone permission, so callers run `capture` off
/// the main loop and re-check their own liveness when it resolves.
pub trait CaptureBackend: Send + Sync + 'static {
    fn capture(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, CaptureError>;
}

/// Deterministic capture for tests and headless runs: permission is always
/// granted and the stream carries a single audio track.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticCapture;

impl CaptureBackend for SyntheticCapture {
    fn capture(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, CaptureError> {
        tracing::debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "synthetic capture"
        );
        Ok(CaptureStream::new(vec![TrackHandle::new()]))
    }
}
