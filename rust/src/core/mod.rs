mod call_control;
mod call_watch;
mod cancel;
mod config;
pub(crate) mod relay;
mod rooms;
mod session;
pub(crate) mod store;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use flume::Sender;

use bargain_media::{CaptureBackend, PeerFactory};

use crate::actions::AppAction;
use crate::state::{
    now_seconds, time_label, AppState, ChatMessage, MessageDeliveryState, PartySide, RoomViewState,
};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use call_control::ActiveCall;
use call_watch::PendingIncoming;
use cancel::CancelToken;
use relay::{ClientFrame, ServerFrame};
use session::Session;
use store::{MessageStore, StoredMessage};

pub(crate) use config::default_app_config_json;

const LOCAL_ECHO_MAX_PER_ROOM: usize = 8;

/// Optimistic copy of one outgoing message, kept so a history refetch can
/// never drop or duplicate something the user already sees.
#[derive(Debug, Clone)]
struct LocalEcho {
    message: ChatMessage,
    seq: u64,
}

pub(crate) type SharedMessageStore = Arc<RwLock<Option<Arc<dyn MessageStore>>>>;
pub(crate) type SharedCaptureBackend = Arc<RwLock<Option<Arc<dyn CaptureBackend>>>>;
pub(crate) type SharedPeerFactory = Arc<RwLock<Option<Arc<dyn PeerFactory>>>>;

pub struct AppCore {
    pub state: AppState,
    rev: u64,
    outbox_seq: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,

    session: Option<Session>,
    session_token: u64,
    open_room_token: u64,

    // Rooms announced to the relay; survives reconnects within a session.
    joined_rooms: HashSet<String>,
    // room_id -> local message id -> optimistic copy (bounded per room).
    local_echo: HashMap<String, HashMap<String, LocalEcho>>,

    active_call: Option<ActiveCall>,
    pending_incoming: Option<PendingIncoming>,

    store_override: SharedMessageStore,
    capture_override: SharedCaptureBackend,
    peer_override: SharedPeerFactory,
}

impl AppCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        party_id: String,
        side: PartySide,
        shared_state: Arc<RwLock<AppState>>,
        store_override: SharedMessageStore,
        capture_override: SharedCaptureBackend,
        peer_override: SharedPeerFactory,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let state = AppState::empty(party_id, side);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let this = Self {
            state,
            rev: 0,
            outbox_seq: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            session: None,
            session_token: 0,
            open_room_token: 0,
            joined_rooms: HashSet::new(),
            local_echo: HashMap::new(),
            active_call: None,
            pending_incoming: None,
            store_override,
            capture_override,
            peer_override,
        };

        // Ensure App::state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_connectivity(&mut self) {
        let rev = self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::ConnectivityChanged {
            rev,
            connected: self.state.connected,
        });
    }

    fn emit_room_list(&mut self) {
        let rev = self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::RoomListChanged {
            rev,
            room_list: self.state.room_list.clone(),
        });
    }

    fn emit_toast(&mut self) {
        let rev = self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::ToastChanged {
            rev,
            toast: self.state.toast.clone(),
        });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Keep the toast in state until the UI explicitly clears it, so a
        // state() snapshot resync still contains it.
        self.state.toast = Some(msg.into());
        self.emit_toast();
    }

    /// Room key between this client and `counterpart_id`, farmer id first.
    /// The single place that knows which side of the key this client sits on.
    fn room_with(&self, counterpart_id: &str) -> String {
        match self.state.side {
            PartySide::Farmer => rooms::room_key(&self.state.party_id, counterpart_id),
            PartySide::Buyer => rooms::room_key(counterpart_id, &self.state.party_id),
        }
    }

    fn emit_relay_frame(&self, frame: ClientFrame) {
        if let Some(relay) = self.session.as_ref().and_then(|s| s.relay.as_ref()) {
            relay.emit(frame);
        }
    }

    fn session_store(&self) -> Option<(Arc<dyn MessageStore>, CancelToken)> {
        self.session
            .as_ref()
            .map(|s| (s.store.clone(), s.cancel.clone()))
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it can contain message text.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::Connect => self.start_session(),
            AppAction::Shutdown => self.handle_shutdown(),
            AppAction::OpenRoom { counterpart_id } => self.open_room(counterpart_id),
            AppAction::CloseRoom => self.close_room(),
            AppAction::SendMessage { room_id, text } => self.send_chat_message(room_id, text),
            AppAction::StartCall { room_id } => self.handle_start_call(room_id),
            AppAction::AcceptIncomingCall => self.handle_accept_incoming_call(),
            AppAction::DismissIncomingCall => self.handle_dismiss_incoming_call(),
            AppAction::EndCall => self.handle_end_call_action(),
            AppAction::ToggleMute => self.handle_toggle_mute(),
            AppAction::ActivateAudio => self.handle_activate_audio(),
            AppAction::ClearToast => {
                self.state.toast = None;
                self.emit_toast();
            }
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::RelayConnected => self.handle_relay_connected(),
            InternalEvent::RelayDisconnected { reason } => self.handle_relay_disconnected(reason),
            InternalEvent::RelayFrame { frame } => self.handle_relay_frame(frame),
            InternalEvent::HistoryFetched {
                room_id,
                token,
                messages,
                error,
            } => self.handle_history_fetched(room_id, token, messages, error),
            InternalEvent::MessagePersisted {
                room_id,
                local_id,
                persisted_id,
                error,
            } => self.handle_message_persisted(room_id, local_id, persisted_id, error),
            InternalEvent::RoomListFetched {
                token,
                rooms,
                error,
            } => self.handle_room_list_fetched(token, rooms, error),
            InternalEvent::RoomPollTick => self.handle_room_poll_tick(),
            InternalEvent::MediaAcquired { call_id, stream } => {
                self.handle_media_acquired(call_id, stream)
            }
            InternalEvent::MediaFailed { call_id, error } => {
                self.handle_media_failed(call_id, error)
            }
            InternalEvent::CallPeerEvent { call_id, event } => {
                self.handle_call_peer_event(call_id, event)
            }
        }
    }

    fn handle_relay_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::SendMessage {
                room_id,
                sender_id,
                text,
                time,
                persisted_id,
            } => self.handle_incoming_chat_message(room_id, sender_id, text, time, persisted_id),
            ServerFrame::CallReceived { signal, from } => self.handle_call_received(signal, from),
            ServerFrame::CallAccepted { signal } => self.handle_remote_call_accepted(signal),
            ServerFrame::EndCall { room_id } => self.handle_remote_end_call(room_id),
        }
    }

    fn handle_shutdown(&mut self) {
        if self.has_live_call() {
            if let Some(room_id) = self.live_call_room() {
                self.send_end_call_frame(&room_id);
            }
            self.end_call_local("shutdown");
        }
        self.pending_incoming = None;
        self.state.incoming_call = None;
        self.open_room_token = self.open_room_token.wrapping_add(1);
        self.state.open_room = None;
        // The room list belongs to the session's poll; a later Connect may
        // resolve a different store, so a stale list must not survive.
        self.state.room_list.clear();
        self.stop_session();
        if self.state.connected {
            self.state.connected = false;
            self.emit_connectivity();
        }
        self.emit_state();
    }

    // ---- Rooms ----

    fn open_room(&mut self, counterpart_id: String) {
        let counterpart_id = counterpart_id.trim().to_string();
        if counterpart_id.is_empty() || counterpart_id == self.state.party_id {
            self.toast("Invalid counterpart");
            return;
        }
        let room_id = self.room_with(&counterpart_id);
        let already_open = self
            .state
            .open_room
            .as_ref()
            .map(|r| r.room_id == room_id)
            .unwrap_or(false);
        if !already_open {
            // Switching rooms mid-call hangs up, same as an explicit close.
            self.close_room_internal();
        }
        self.state.open_room = Some(RoomViewState {
            room_id: room_id.clone(),
            counterpart_id,
            messages: vec![],
        });
        self.join_room(&room_id);
        self.request_history(&room_id);
        self.emit_state();
    }

    fn close_room(&mut self) {
        self.close_room_internal();
        self.emit_state();
    }

    fn close_room_internal(&mut self) {
        // Invalidate any in-flight history load for the closing room.
        self.open_room_token = self.open_room_token.wrapping_add(1);
        let Some(open) = self.state.open_room.take() else {
            return;
        };
        if self.has_live_call_in_room(&open.room_id) {
            // Leaving the call surface is a hang-up, and the counterpart
            // must hear about it.
            self.send_end_call_frame(&open.room_id);
            self.end_call_local("room_closed");
        }
    }

    /// Idempotent: the membership set keeps one entry per room no matter how
    /// many polls or opens report it; the join frame goes out once, and again
    /// for the whole set on every reconnect.
    fn join_room(&mut self, room_id: &str) {
        if self.joined_rooms.insert(room_id.to_string()) {
            self.emit_relay_frame(ClientFrame::JoinRoom {
                room_id: room_id.to_string(),
            });
        }
    }

    fn request_history(&mut self, room_id: &str) {
        let Some((store, cancel)) = self.session_store() else {
            return;
        };
        self.open_room_token = self.open_room_token.wrapping_add(1);
        let token = self.open_room_token;
        let tx = self.core_sender.clone();
        let room_id = room_id.to_string();
        let future = store.fetch_history(&room_id);
        self.runtime.spawn(async move {
            let result = future.await;
            if cancel.is_cancelled() {
                return;
            }
            let (messages, error) = match result {
                Ok(messages) => (Some(messages), None),
                Err(err) => (None, Some(format!("{err:#}"))),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::HistoryFetched {
                room_id,
                token,
                messages,
                error,
            })));
        });
    }

    fn handle_history_fetched(
        &mut self,
        room_id: String,
        token: u64,
        messages: Option<Vec<StoredMessage>>,
        error: Option<String>,
    ) {
        if token != self.open_room_token {
            return; // stale: the room switched or closed during the fetch
        }
        let open_matches = self
            .state
            .open_room
            .as_ref()
            .map(|r| r.room_id == room_id)
            .unwrap_or(false);
        if !open_matches {
            return;
        }
        if let Some(err) = error {
            // History is best effort; the room stays usable on live traffic.
            tracing::warn!(room_id = %room_id, err = %err, "history fetch failed");
            return;
        }
        let Some(stored) = messages else { return };

        let me = self.state.party_id.clone();
        let mut list: Vec<ChatMessage> = stored
            .into_iter()
            .map(|m| chat_message_from_stored(m, &me))
            .collect();
        // Re-apply optimistic copies in send order; the identity rule merges
        // the ones the store already returned.
        if let Some(outbox) = self.local_echo.get(&room_id) {
            let mut entries: Vec<&LocalEcho> = outbox.values().collect();
            entries.sort_by_key(|e| e.seq);
            for entry in entries {
                rooms::apply_incoming(&mut list, entry.message.clone());
            }
        }
        if let Some(open) = self.state.open_room.as_mut() {
            open.messages = list;
        }
        self.emit_state();
    }

    fn send_chat_message(&mut self, room_id: String, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        match self.state.open_room.as_ref().map(|r| r.room_id.clone()) {
            None => {
                self.toast("No room open");
                return;
            }
            Some(current) if current != room_id => {
                // Stale action from a view that already navigated away.
                tracing::debug!(room_id = %room_id, "send for non-open room ignored");
                return;
            }
            Some(_) => {}
        }

        let label = time_label(now_seconds());
        let local_id = uuid::Uuid::new_v4().to_string();
        let message = ChatMessage {
            id: local_id.clone(),
            room_id: room_id.clone(),
            sender_id: self.state.party_id.clone(),
            text: text.clone(),
            time_label: label.clone(),
            persisted_id: None,
            is_mine: true,
            delivery: MessageDeliveryState::Pending,
        };

        // Optimistic insert first; the fan-out and the store reconcile later.
        if let Some(open) = self.state.open_room.as_mut() {
            open.messages.push(message.clone());
        }
        self.outbox_seq += 1;
        let seq = self.outbox_seq;
        self.local_echo
            .entry(room_id.clone())
            .or_default()
            .insert(local_id.clone(), LocalEcho { message, seq });
        self.prune_local_echo(&room_id);
        self.emit_state();

        self.emit_relay_frame(ClientFrame::SendMessage {
            room_id: room_id.clone(),
            sender_id: self.state.party_id.clone(),
            text: text.clone(),
            time: label.clone(),
        });

        // Persist independently of the live fan-out.
        let Some((store, cancel)) = self.session_store() else {
            return;
        };
        let tx = self.core_sender.clone();
        let stored = StoredMessage {
            persisted_id: None,
            room_id: room_id.clone(),
            sender_id: self.state.party_id.clone(),
            text,
            time: label,
        };
        let future = store.append_message(stored);
        self.runtime.spawn(async move {
            let result = future.await;
            if cancel.is_cancelled() {
                return;
            }
            let (persisted_id, error) = match result {
                Ok(saved) => (saved.persisted_id, None),
                Err(err) => (None, Some(format!("{err:#}"))),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::MessagePersisted {
                    room_id,
                    local_id,
                    persisted_id,
                    error,
                },
            )));
        });
    }

    fn handle_message_persisted(
        &mut self,
        room_id: String,
        local_id: String,
        persisted_id: Option<String>,
        error: Option<String>,
    ) {
        if let Some(err) = error {
            // Logged only: the optimistic copy stays and is not retried.
            tracing::warn!(room_id = %room_id, err = %err, "message persist failed");
            return;
        }
        let Some(persisted_id) = persisted_id else {
            tracing::warn!(room_id = %room_id, "store ack without persisted id");
            return;
        };

        if let Some(entry) = self
            .local_echo
            .get_mut(&room_id)
            .and_then(|outbox| outbox.get_mut(&local_id))
        {
            entry.message.persisted_id = Some(persisted_id.clone());
            entry.message.delivery = MessageDeliveryState::Sent;
        }

        let mut changed = false;
        if let Some(open) = self.state.open_room.as_mut() {
            if open.room_id == room_id {
                if let Some(message) = open.messages.iter_mut().find(|m| m.id == local_id) {
                    if message.persisted_id.is_none() {
                        message.persisted_id = Some(persisted_id);
                    }
                    message.delivery = MessageDeliveryState::Sent;
                    changed = true;
                }
            }
        }
        if changed {
            self.emit_state();
        }
    }

    fn handle_incoming_chat_message(
        &mut self,
        room_id: String,
        sender_id: String,
        text: String,
        time: String,
        persisted_id: Option<String>,
    ) {
        let preview_changed = self.touch_room_preview(&room_id, &text, &time);

        let incoming = ChatMessage {
            id: persisted_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            room_id: room_id.clone(),
            sender_id: sender_id.clone(),
            is_mine: sender_id == self.state.party_id,
            text,
            time_label: time,
            persisted_id,
            delivery: MessageDeliveryState::Sent,
        };

        // Sync any optimistic copy first, so a later history refetch sees the
        // adopted id too.
        if incoming.is_mine {
            if let Some(outbox) = self.local_echo.get_mut(&room_id) {
                for entry in outbox.values_mut() {
                    if entry.message.persisted_id.is_none()
                        && incoming.persisted_id.is_some()
                        && rooms::same_logical_message(&entry.message, &incoming)
                    {
                        entry.message.persisted_id = incoming.persisted_id.clone();
                    }
                }
            }
        }

        let view_changed = match self.state.open_room.as_mut() {
            // Broadcasts for any other room never touch the open view.
            Some(open) if open.room_id == room_id => {
                rooms::apply_incoming(&mut open.messages, incoming)
            }
            _ => false,
        };

        if preview_changed || view_changed {
            self.emit_state();
        }
    }

    fn touch_room_preview(&mut self, room_id: &str, text: &str, time: &str) -> bool {
        let Some(entry) = self
            .state
            .room_list
            .iter_mut()
            .find(|r| r.room_id == room_id)
        else {
            return false;
        };
        entry.last_message = Some(text.to_string());
        entry.last_time_label = Some(time.to_string());
        true
    }

    fn prune_local_echo(&mut self, room_id: &str) {
        let Some(outbox) = self.local_echo.get_mut(room_id) else {
            return;
        };
        if outbox.len() <= LOCAL_ECHO_MAX_PER_ROOM {
            return;
        }
        // Keep only the newest N by local sequence number.
        let mut items: Vec<(String, u64)> = outbox
            .iter()
            .map(|(id, entry)| (id.clone(), entry.seq))
            .collect();
        items.sort_by_key(|(_, seq)| std::cmp::Reverse(*seq));
        items.truncate(LOCAL_ECHO_MAX_PER_ROOM);
        let keep: HashSet<String> = items.into_iter().map(|(id, _)| id).collect();
        outbox.retain(|id, _| keep.contains(id));
    }
}

fn chat_message_from_stored(stored: StoredMessage, my_party_id: &str) -> ChatMessage {
    let persisted_id = stored.persisted_id;
    ChatMessage {
        id: persisted_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        room_id: stored.room_id,
        is_mine: stored.sender_id == my_party_id,
        sender_id: stored.sender_id,
        text: stored.text,
        time_label: stored.time,
        persisted_id,
        delivery: MessageDeliveryState::Sent,
    }
}
