// Session lifecycle + relay connectivity transitions.

use std::sync::Arc;

use super::cancel::CancelToken;
use super::relay::{ClientFrame, RelayLink};
use super::store::{HttpStore, MessageStore};
use super::AppCore;
use crate::state::PartySide;

pub(super) struct Session {
    pub(super) cancel: CancelToken,
    /// None when the network is disabled; emits become silent no-ops.
    pub(super) relay: Option<RelayLink>,
    pub(super) store: Arc<dyn MessageStore>,
}

impl AppCore {
    pub(super) fn start_session(&mut self) {
        if self.session.is_some() {
            tracing::debug!("session already started");
            return;
        }
        self.session_token = self.session_token.wrapping_add(1);

        let cancel = CancelToken::new();
        let store = self.resolve_store();
        let relay = if self.network_enabled() {
            let url = self.relay_url();
            tracing::info!(url = %url, "starting relay link");
            Some(RelayLink::spawn(
                &self.runtime,
                url,
                cancel.clone(),
                self.core_sender.clone(),
            ))
        } else {
            tracing::info!("network disabled; relay link not started");
            None
        };

        self.session = Some(Session {
            cancel: cancel.clone(),
            relay,
            store,
        });

        // Only the farmer side watches its whole room set; the buyer side
        // opens one room at a time.
        if self.state.side == PartySide::Farmer {
            self.spawn_room_poll(cancel);
        }
    }

    pub(super) fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
        }
        // Flip the token so results from the old session are discarded even if
        // they were already queued.
        self.session_token = self.session_token.wrapping_add(1);
        self.joined_rooms.clear();
    }

    fn resolve_store(&self) -> Arc<dyn MessageStore> {
        let slot = match self.store_override.read() {
            Ok(guard) => guard.clone(),
            Err(poison) => poison.into_inner().clone(),
        };
        match slot {
            Some(store) => store,
            None => Arc::new(HttpStore::new(self.store_url())),
        }
    }

    pub(super) fn handle_relay_connected(&mut self) {
        if self.session.is_none() {
            // The link lost a race with shutdown; its cancel flag is set and
            // the actor is about to exit.
            return;
        }
        if !self.state.connected {
            self.state.connected = true;
            self.emit_connectivity();
        }

        // (Re)announce identity and membership on every connect, then refresh
        // the open room so messages sent while offline reappear from history.
        self.emit_relay_frame(ClientFrame::Hello {
            party_id: self.state.party_id.clone(),
        });
        let rooms: Vec<String> = self.joined_rooms.iter().cloned().collect();
        for room_id in rooms {
            self.emit_relay_frame(ClientFrame::JoinRoom { room_id });
        }
        if let Some(room_id) = self.state.open_room.as_ref().map(|r| r.room_id.clone()) {
            self.request_history(&room_id);
        }
    }

    pub(super) fn handle_relay_disconnected(&mut self, reason: Option<String>) {
        if let Some(reason) = &reason {
            tracing::debug!(reason = %reason, "relay disconnected");
        }
        if self.state.connected {
            self.state.connected = false;
            self.emit_connectivity();
        }
    }
}
