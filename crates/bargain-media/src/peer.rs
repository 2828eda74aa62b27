use std::sync::Arc;

use crate::capture::CaptureStream;
use crate::signal::{IceCandidate, SessionDescription, SignalBundle, SDP_TYPE_ANSWER, SDP_TYPE_OFFER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

/// NAT traversal configuration for one peer session.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub stun_servers: Vec<String>,
    /// Always false in this design: candidates are batched into the single
    /// `LocalSignal` bundle instead of trickling one event per candidate.
    pub trickle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer session closed")]
    Closed,
    #[error("unexpected signal: {0}")]
    Signal(String),
    #[error("peer backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The batched local description plus all gathered candidates, ready to
    /// hand to the signaling layer. Emitted exactly once per session.
    LocalSignal(SignalBundle),
    /// First remote media track arrived.
    RemoteTrack,
    /// Remote media is flowing but playout needs a user gesture to start.
    PlayoutBlocked,
    /// Unrecoverable negotiation or transport failure.
    Failed(String),
}

/// Callback through which a peer session reports progress. Implementations
/// must be cheap and non-blocking; sessions may invoke it from arbitrary
/// threads.
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

pub trait PeerSession: Send {
    /// Apply the counterpart's bundle. Initiators expect an answer,
    /// responders an offer. Violations are `PeerError::Signal`.
    fn apply_remote_signal(&mut self, bundle: &SignalBundle) -> Result<(), PeerError>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

pub trait PeerFactory: Send + Sync + 'static {
    fn open(
        &self,
        role: PeerRole,
        config: &PeerConfig,
        stream: &CaptureStream,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerSession>, PeerError>;
}

/// In-memory peer used by tests and headless runs. It fabricates a plausible
/// description, "gathers" its candidates instantly, and treats a completed
/// offer/answer exchange as connected media.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackPeerFactory {
    /// Report `PlayoutBlocked` right after the remote track, simulating an
    /// autoplay-restricted host.
    pub playout_blocked: bool,
}

impl PeerFactory for LoopbackPeerFactory {
    fn open(
        &self,
        role: PeerRole,
        config: &PeerConfig,
        stream: &CaptureStream,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerSession>, PeerError> {
        if stream.live_track_count() == 0 {
            return Err(PeerError::Backend("no live local tracks".to_string()));
        }
        let peer = LoopbackPeer {
            role,
            stun_servers: config.stun_servers.clone(),
            playout_blocked: self.playout_blocked,
            events,
            closed: false,
        };
        tracing::debug!(?role, stun = peer.stun_servers.len(), "loopback peer open");
        if role == PeerRole::Initiator {
            // Gathering completes immediately; the whole offer goes out as
            // one bundle.
            (peer.events)(PeerEvent::LocalSignal(peer.local_bundle(SDP_TYPE_OFFER)));
        }
        Ok(Box::new(peer))
    }
}

struct LoopbackPeer {
    role: PeerRole,
    stun_servers: Vec<String>,
    playout_blocked: bool,
    events: PeerEventSink,
    closed: bool,
}

impl LoopbackPeer {
    fn local_bundle(&self, kind: &str) -> SignalBundle {
        let mut candidates = vec![IceCandidate {
            candidate: "candidate:1 1 UDP 2122252543 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }];
        if !self.stun_servers.is_empty() {
            candidates.push(IceCandidate {
                candidate: "candidate:2 1 UDP 1686052607 127.0.0.1 9 typ srflx".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
        SignalBundle {
            description: SessionDescription {
                kind: kind.to_string(),
                sdp: format!(
                    "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=loopback\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na={kind}\r\n"
                ),
            },
            candidates,
        }
    }

    fn remote_media_up(&self) {
        (self.events)(PeerEvent::RemoteTrack);
        if self.playout_blocked {
            (self.events)(PeerEvent::PlayoutBlocked);
        }
    }
}

impl PeerSession for LoopbackPeer {
    fn apply_remote_signal(&mut self, bundle: &SignalBundle) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::Closed);
        }
        match self.role {
            PeerRole::Initiator => {
                if !bundle.is_answer() {
                    return Err(PeerError::Signal(format!(
                        "initiator expected answer, got {}",
                        bundle.description.kind
                    )));
                }
                self.remote_media_up();
            }
            PeerRole::Responder => {
                if !bundle.is_offer() {
                    return Err(PeerError::Signal(format!(
                        "responder expected offer, got {}",
                        bundle.description.kind
                    )));
                }
                (self.events)(PeerEvent::LocalSignal(self.local_bundle(SDP_TYPE_ANSWER)));
                self.remote_media_up();
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
