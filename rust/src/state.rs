#[derive(Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub party_id: String,
    pub side: PartySide,
    pub connected: bool,
    pub room_list: Vec<RoomSummary>,
    pub open_room: Option<RoomViewState>,
    pub active_call: Option<CallState>,
    pub incoming_call: Option<IncomingCallPrompt>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty(party_id: String, side: PartySide) -> Self {
        Self {
            rev: 0,
            party_id,
            side,
            connected: false,
            room_list: vec![],
            open_room: None,
            active_call: None,
            incoming_call: None,
            toast: None,
        }
    }
}

/// Which end of a negotiation this client is. The farmer side fields calls
/// from many buyers at once; the buyer side talks to one farmer per room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartySide {
    Farmer,
    Buyer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: String,
    pub last_message: Option<String>,
    pub last_time_label: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RoomViewState {
    pub room_id: String,
    pub counterpart_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
    /// Wall-clock label minted once by the sender. It travels with the message
    /// and is never regenerated on the receiving side, so it doubles as part of
    /// the fallback identity for copies that lack a store id.
    pub time_label: String,
    pub persisted_id: Option<String>,
    pub is_mine: bool,
    pub delivery: MessageDeliveryState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageDeliveryState {
    /// Inserted locally, not yet acknowledged by the store.
    Pending,
    /// The store accepted it and assigned a persisted id.
    Sent,
}

#[derive(Clone, Debug)]
pub struct CallState {
    pub call_id: String,
    pub room_id: String,
    pub counterpart_id: String,
    pub initiated_by_me: bool,
    pub status: CallStatus,
    pub is_live: bool,
    pub is_muted: bool,
    pub remote_streaming: bool,
    /// The playout path is blocked until the user interacts (autoplay policy).
    /// Recoverable: cleared by `AppAction::ActivateAudio`, never a failure.
    pub needs_audio_activation: bool,
    pub started_at: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallStatus {
    AcquiringMedia,
    Ringing,
    Offering,
    Connected,
    Ended { reason: String },
    Failed { reason: String },
}

impl CallStatus {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::AcquiringMedia | Self::Ringing | Self::Offering | Self::Connected
        )
    }
}

impl CallState {
    pub fn new(
        call_id: String,
        room_id: String,
        counterpart_id: String,
        initiated_by_me: bool,
        status: CallStatus,
    ) -> Self {
        Self {
            call_id,
            room_id,
            counterpart_id,
            initiated_by_me,
            is_live: status.is_live(),
            status,
            is_muted: false,
            remote_streaming: false,
            needs_audio_activation: false,
            started_at: None,
        }
    }

    pub fn set_status(&mut self, status: CallStatus) {
        self.is_live = status.is_live();
        if !self.is_live {
            // A terminal call never shows live-media indicators.
            self.remote_streaming = false;
            self.needs_audio_activation = false;
        }
        self.status = status;
    }
}

/// One pending call offer, surfaced to the UI until accepted or dismissed.
/// Only a single prompt is held at a time; offers arriving while busy are
/// dropped by the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingCallPrompt {
    pub room_id: String,
    pub caller_id: String,
}

pub fn now_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Render an epoch timestamp as the `HH:MM` label carried on the wire.
pub fn time_label(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.format("%H:%M").to_string())
        .unwrap_or_default()
}
