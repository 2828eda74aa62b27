use bargain_media::{CaptureError, CaptureStream, PeerEvent};

use crate::core::relay::ServerFrame;
use crate::core::store::{RoomEntry, StoredMessage};
use crate::state::{AppState, RoomSummary};
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    ConnectivityChanged {
        rev: u64,
        connected: bool,
    },
    RoomListChanged {
        rev: u64,
        room_list: Vec<RoomSummary>,
    },
    ToastChanged {
        rev: u64,
        toast: Option<String>,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::ConnectivityChanged { rev, .. } => *rev,
            AppUpdate::RoomListChanged { rev, .. } => *rev,
            AppUpdate::ToastChanged { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Relay link
    RelayConnected,
    RelayDisconnected {
        reason: Option<String>,
    },
    RelayFrame {
        frame: ServerFrame,
    },

    // Store results
    HistoryFetched {
        room_id: String,
        token: u64,
        messages: Option<Vec<StoredMessage>>,
        error: Option<String>,
    },
    MessagePersisted {
        room_id: String,
        local_id: String,
        persisted_id: Option<String>,
        error: Option<String>,
    },
    RoomListFetched {
        token: u64,
        rooms: Option<Vec<RoomEntry>>,
        error: Option<String>,
    },
    RoomPollTick,

    // Call side effects
    MediaAcquired {
        call_id: String,
        stream: CaptureStream,
    },
    MediaFailed {
        call_id: String,
        error: CaptureError,
    },
    CallPeerEvent {
        call_id: String,
        event: PeerEvent,
    },
}
