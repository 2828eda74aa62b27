pub mod capture;
pub mod peer;
pub mod signal;

pub use capture::{
    CaptureBackend, CaptureConstraints, CaptureError, CaptureStream, SyntheticCapture, TrackHandle,
};
pub use peer::{
    LoopbackPeerFactory, PeerConfig, PeerError, PeerEvent, PeerEventSink, PeerFactory, PeerRole,
    PeerSession,
};
pub use signal::{IceCandidate, SessionDescription, SignalBundle, SDP_TYPE_ANSWER, SDP_TYPE_OFFER};
