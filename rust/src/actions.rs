#[derive(Debug, Clone)]
pub enum AppAction {
    // Lifecycle
    Connect,
    Shutdown,

    // Rooms
    OpenRoom {
        counterpart_id: String,
    },
    CloseRoom,
    SendMessage {
        room_id: String,
        text: String,
    },

    // Calls
    StartCall {
        room_id: String,
    },
    AcceptIncomingCall,
    DismissIncomingCall,
    EndCall,
    ToggleMute,
    ActivateAudio,

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe action tag (never includes message text).
    pub fn tag(&self) -> &'static str {
        match self {
            // Lifecycle
            AppAction::Connect => "Connect",
            AppAction::Shutdown => "Shutdown",

            // Rooms
            AppAction::OpenRoom { .. } => "OpenRoom",
            AppAction::CloseRoom => "CloseRoom",
            AppAction::SendMessage { .. } => "SendMessage",

            // Calls
            AppAction::StartCall { .. } => "StartCall",
            AppAction::AcceptIncomingCall => "AcceptIncomingCall",
            AppAction::DismissIncomingCall => "DismissIncomingCall",
            AppAction::EndCall => "EndCall",
            AppAction::ToggleMute => "ToggleMute",
            AppAction::ActivateAudio => "ActivateAudio",

            // UI
            AppAction::ClearToast => "ClearToast",
        }
    }
}
