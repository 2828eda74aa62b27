// Call state machine: media acquisition, peer setup, non-trickled signaling
// and symmetric teardown. One call at a time, bound to its negotiation room.

use std::sync::Arc;

use bargain_media::{
    CaptureBackend, CaptureConstraints, CaptureError, CaptureStream, LoopbackPeerFactory,
    PeerConfig, PeerEvent, PeerEventSink, PeerFactory, PeerRole, PeerSession, SignalBundle,
    SyntheticCapture,
};
use serde_json::Value;

use super::cancel::CancelToken;
use super::relay::ClientFrame;
use super::AppCore;
use crate::state::{now_seconds, CallState, CallStatus};
use crate::updates::{CoreMsg, InternalEvent};

/// Actor-side call bookkeeping. The UI-facing mirror lives in
/// `AppState::active_call`; this struct owns the media handles.
pub(super) struct ActiveCall {
    pub(super) call_id: String,
    pub(super) room_id: String,
    pub(super) counterpart_id: String,
    pub(super) initiated_by_me: bool,
    pub(super) cancel: CancelToken,
    pub(super) stream: Option<CaptureStream>,
    pub(super) peer: Option<Box<dyn PeerSession>>,
    /// Responder only: the offer that triggered this call, applied once local
    /// media and the peer session are up.
    pub(super) pending_offer: Option<SignalBundle>,
}

impl AppCore {
    pub(super) fn has_live_call(&self) -> bool {
        self.state
            .active_call
            .as_ref()
            .map(|c| c.is_live)
            .unwrap_or(false)
    }

    pub(super) fn has_live_call_in_room(&self, room_id: &str) -> bool {
        self.state
            .active_call
            .as_ref()
            .map(|c| c.is_live && c.room_id == room_id)
            .unwrap_or(false)
    }

    pub(super) fn live_call_room(&self) -> Option<String> {
        self.state
            .active_call
            .as_ref()
            .filter(|c| c.is_live)
            .map(|c| c.room_id.clone())
    }

    pub(super) fn send_end_call_frame(&self, room_id: &str) {
        self.emit_relay_frame(ClientFrame::EndCall {
            room_id: room_id.to_string(),
        });
    }

    pub(super) fn handle_start_call(&mut self, room_id: String) {
        if self.has_live_call() {
            self.toast("Already in a call");
            return;
        }
        let counterpart_id = match self
            .state
            .open_room
            .as_ref()
            .filter(|r| r.room_id == room_id)
        {
            Some(open) => open.counterpart_id.clone(),
            None => {
                self.toast("Open the room before calling");
                return;
            }
        };
        self.begin_call(room_id, counterpart_id, true, None);
    }

    pub(super) fn handle_accept_incoming_call(&mut self) {
        let Some(pending) = self.pending_incoming.take() else {
            tracing::debug!("accept with no pending call offer");
            return;
        };
        if self.has_live_call() {
            self.pending_incoming = Some(pending);
            self.toast("Already in a call");
            return;
        }
        self.state.incoming_call = None;

        // Accepting lands the user in the negotiation room, unless it is
        // already the open one.
        let already_open = self
            .state
            .open_room
            .as_ref()
            .map(|r| r.room_id == pending.room_id)
            .unwrap_or(false);
        if !already_open {
            self.open_room(pending.caller_id.clone());
        }
        self.begin_call(pending.room_id, pending.caller_id, false, Some(pending.offer));
    }

    fn begin_call(
        &mut self,
        room_id: String,
        counterpart_id: String,
        initiated_by_me: bool,
        pending_offer: Option<SignalBundle>,
    ) {
        let call_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        tracing::info!(call_id = %call_id, room_id = %room_id, initiated_by_me, "call starting");

        self.active_call = Some(ActiveCall {
            call_id: call_id.clone(),
            room_id: room_id.clone(),
            counterpart_id: counterpart_id.clone(),
            initiated_by_me,
            cancel: cancel.clone(),
            stream: None,
            peer: None,
            pending_offer,
        });
        self.state.active_call = Some(CallState::new(
            call_id.clone(),
            room_id,
            counterpart_id,
            initiated_by_me,
            CallStatus::AcquiringMedia,
        ));
        self.emit_state();
        self.spawn_media_acquisition(call_id, cancel);
    }

    fn capture_backend(&self) -> Arc<dyn CaptureBackend> {
        let slot = match self.capture_override.read() {
            Ok(guard) => guard.clone(),
            Err(poison) => poison.into_inner().clone(),
        };
        if let Some(backend) = slot {
            return backend;
        }
        match self.config.call_audio_backend.as_deref() {
            None | Some("synthetic") => {}
            Some(other) => {
                tracing::warn!(backend = %other, "unknown call_audio_backend; using synthetic");
            }
        }
        Arc::new(SyntheticCapture)
    }

    fn peer_factory(&self) -> Arc<dyn PeerFactory> {
        let slot = match self.peer_override.read() {
            Ok(guard) => guard.clone(),
            Err(poison) => poison.into_inner().clone(),
        };
        slot.unwrap_or_else(|| Arc::new(LoopbackPeerFactory::default()))
    }

    fn spawn_media_acquisition(&self, call_id: String, cancel: CancelToken) {
        let backend = self.capture_backend();
        let tx = self.core_sender.clone();
        // Capture may block on a permission prompt; keep it off the actor
        // thread and off the async workers.
        self.runtime.spawn_blocking(move || {
            let result = backend.capture(&CaptureConstraints::default());
            if cancel.is_cancelled() {
                // The call is already gone; never leave granted tracks live.
                if let Ok(stream) = &result {
                    stream.stop_all();
                }
                return;
            }
            let event = match result {
                Ok(stream) => InternalEvent::MediaAcquired { call_id, stream },
                Err(error) => InternalEvent::MediaFailed { call_id, error },
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }

    pub(super) fn handle_media_acquired(&mut self, call_id: String, stream: CaptureStream) {
        let Some(mut call) = self.active_call.take() else {
            stream.stop_all();
            return;
        };
        if call.call_id != call_id || call.cancel.is_cancelled() {
            // Completion raced a teardown or a newer call; release the grant.
            stream.stop_all();
            self.active_call = Some(call);
            return;
        }

        let tx = self.core_sender.clone();
        let sink_call_id = call_id.clone();
        let sink: PeerEventSink = Arc::new(move |event| {
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::CallPeerEvent {
                call_id: sink_call_id.clone(),
                event,
            })));
        });
        let role = if call.initiated_by_me {
            PeerRole::Initiator
        } else {
            PeerRole::Responder
        };
        let config = PeerConfig {
            stun_servers: self.stun_servers(),
            trickle: false,
        };

        match self.peer_factory().open(role, &config, &stream, sink) {
            Ok(peer) => {
                // A mute toggled during acquisition applies to the new tracks.
                let muted = self
                    .state
                    .active_call
                    .as_ref()
                    .map(|c| c.is_muted)
                    .unwrap_or(false);
                if muted {
                    stream.set_enabled(false);
                }
                call.stream = Some(stream);
                call.peer = Some(peer);
            }
            Err(err) => {
                stream.stop_all();
                self.active_call = Some(call);
                self.fail_call(format!("Peer setup failed: {err}"));
                return;
            }
        }

        let pending_offer = call.pending_offer.take();
        let initiated_by_me = call.initiated_by_me;
        self.active_call = Some(call);

        let next = if initiated_by_me {
            CallStatus::Ringing
        } else {
            CallStatus::Offering
        };
        self.set_call_status(next);

        if let Some(offer) = pending_offer {
            self.apply_remote_signal(&offer);
        }
    }

    pub(super) fn handle_media_failed(&mut self, call_id: String, error: CaptureError) {
        let matches = self
            .active_call
            .as_ref()
            .map(|c| c.call_id == call_id)
            .unwrap_or(false);
        if !matches {
            return;
        }
        let reason = if error.is_permission() {
            "Microphone permission denied".to_string()
        } else {
            format!("Media error: {error}")
        };
        self.fail_call(reason);
    }

    pub(super) fn handle_call_peer_event(&mut self, call_id: String, event: PeerEvent) {
        let matches = self
            .active_call
            .as_ref()
            .map(|c| c.call_id == call_id)
            .unwrap_or(false);
        if !matches || !self.has_live_call() {
            tracing::debug!("peer event for stale call dropped");
            return;
        }
        match event {
            PeerEvent::LocalSignal(bundle) => self.send_local_signal(bundle),
            PeerEvent::RemoteTrack => {
                if let Some(view) = self.state.active_call.as_mut() {
                    view.set_status(CallStatus::Connected);
                    view.remote_streaming = true;
                    if view.started_at.is_none() {
                        view.started_at = Some(now_seconds());
                    }
                }
                self.emit_state();
            }
            PeerEvent::PlayoutBlocked => {
                // Recoverable: the UI shows a tap-to-activate affordance.
                if let Some(view) = self.state.active_call.as_mut() {
                    view.needs_audio_activation = true;
                }
                self.emit_state();
            }
            PeerEvent::Failed(reason) => self.fail_call(format!("Call failed: {reason}")),
        }
    }

    /// Forward our one batched signal bundle. Initiators dial the counterpart
    /// directly; responders answer back along the same addressing.
    fn send_local_signal(&mut self, bundle: SignalBundle) {
        let Some(call) = self.active_call.as_ref() else {
            return;
        };
        let signal = bundle.to_value();
        let frame = if call.initiated_by_me {
            ClientFrame::CallUser {
                user_to_call: call.counterpart_id.clone(),
                signal_data: signal,
                from: self.state.party_id.clone(),
                room_id: call.room_id.clone(),
            }
        } else {
            ClientFrame::AnswerCall {
                signal,
                to: call.counterpart_id.clone(),
                from: self.state.party_id.clone(),
                room_id: call.room_id.clone(),
            }
        };
        self.emit_relay_frame(frame);
    }

    pub(super) fn handle_remote_call_accepted(&mut self, signal: Value) {
        let ringing = self
            .state
            .active_call
            .as_ref()
            .map(|c| matches!(c.status, CallStatus::Ringing))
            .unwrap_or(false);
        if !ringing {
            // Late or duplicate answer; the call already moved on.
            tracing::debug!("call-accepted ignored outside ringing");
            return;
        }
        let Some(answer) = SignalBundle::from_value(&signal) else {
            self.fail_call("Unreadable answer signal".to_string());
            return;
        };
        self.apply_remote_signal(&answer);
    }

    pub(super) fn handle_remote_end_call(&mut self, room_id: String) {
        // A caller who hung up before we accepted withdraws the prompt.
        let prompt_matches = self
            .state
            .incoming_call
            .as_ref()
            .map(|p| p.room_id == room_id)
            .unwrap_or(false);
        if prompt_matches {
            self.pending_incoming = None;
            self.state.incoming_call = None;
            self.emit_state();
        }
        if self.has_live_call_in_room(&room_id) {
            // The counterpart already tore down; end locally without echoing
            // the frame back.
            self.end_call_local("remote_hangup");
        }
    }

    pub(super) fn handle_end_call_action(&mut self) {
        if !self.has_live_call() {
            return;
        }
        if let Some(room_id) = self.live_call_room() {
            self.send_end_call_frame(&room_id);
        }
        self.end_call_local("user_hangup");
    }

    pub(super) fn handle_toggle_mute(&mut self) {
        if !self.has_live_call() {
            return;
        }
        let muted = self
            .state
            .active_call
            .as_ref()
            .map(|c| !c.is_muted)
            .unwrap_or(false);
        if let Some(stream) = self.active_call.as_ref().and_then(|c| c.stream.as_ref()) {
            stream.set_enabled(!muted);
        }
        if let Some(view) = self.state.active_call.as_mut() {
            view.is_muted = muted;
        }
        self.emit_state();
    }

    pub(super) fn handle_activate_audio(&mut self) {
        let Some(view) = self.state.active_call.as_mut() else {
            return;
        };
        if view.needs_audio_activation {
            view.needs_audio_activation = false;
            self.emit_state();
        }
    }

    fn set_call_status(&mut self, status: CallStatus) {
        if let Some(view) = self.state.active_call.as_mut() {
            view.set_status(status);
        }
        self.emit_state();
    }

    fn apply_remote_signal(&mut self, bundle: &SignalBundle) {
        let result = match self.active_call.as_mut().and_then(|c| c.peer.as_mut()) {
            Some(peer) => peer.apply_remote_signal(bundle),
            None => return,
        };
        if let Err(err) = result {
            self.fail_call(format!("Signaling failed: {err}"));
        }
    }

    pub(super) fn end_call_local(&mut self, reason: &str) {
        tracing::info!(reason = %reason, "call ended");
        self.teardown_call();
        if let Some(view) = self.state.active_call.as_mut() {
            if view.is_live {
                view.set_status(CallStatus::Ended {
                    reason: reason.to_string(),
                });
            }
        }
        self.emit_state();
    }

    fn fail_call(&mut self, reason: String) {
        tracing::warn!(reason = %reason, "call failed");
        self.teardown_call();
        if let Some(view) = self.state.active_call.as_mut() {
            view.set_status(CallStatus::Failed { reason });
        }
        self.emit_state();
    }

    /// Teardown order: stop accepting events, stop local tracks, close the
    /// peer. Async completions still in flight see the flipped token and
    /// discard themselves.
    fn teardown_call(&mut self) {
        let Some(mut call) = self.active_call.take() else {
            return;
        };
        call.cancel.cancel();
        if let Some(stream) = call.stream.take() {
            stream.stop_all();
        }
        if let Some(mut peer) = call.peer.take() {
            peer.close();
        }
    }
}
