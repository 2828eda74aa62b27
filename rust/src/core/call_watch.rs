// Multi-room watcher: polls the party's room index, keeps relay membership in
// step, and turns directed call offers into a single incoming-call prompt.

use bargain_media::SignalBundle;
use serde_json::Value;

use super::cancel::CancelToken;
use super::store::RoomEntry;
use super::AppCore;
use crate::state::{IncomingCallPrompt, RoomSummary};
use crate::updates::{CoreMsg, InternalEvent};

/// One parked call offer, held until the user accepts or dismisses it.
#[derive(Debug, Clone)]
pub(super) struct PendingIncoming {
    pub(super) room_id: String,
    pub(super) caller_id: String,
    pub(super) offer: SignalBundle,
}

impl AppCore {
    pub(super) fn spawn_room_poll(&self, cancel: CancelToken) {
        let period = std::time::Duration::from_secs(self.room_poll_secs());
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if cancel.is_cancelled() {
                    return;
                }
                if tx
                    .send(CoreMsg::Internal(Box::new(InternalEvent::RoomPollTick)))
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    pub(super) fn handle_room_poll_tick(&mut self) {
        let Some((store, cancel)) = self.session_store() else {
            return;
        };
        let token = self.session_token;
        let tx = self.core_sender.clone();
        let future = store.list_active_rooms(&self.state.party_id);
        self.runtime.spawn(async move {
            let result = future.await;
            if cancel.is_cancelled() {
                return;
            }
            let (rooms, error) = match result {
                Ok(rooms) => (Some(rooms), None),
                Err(err) => (None, Some(format!("{err:#}"))),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::RoomListFetched {
                token,
                rooms,
                error,
            })));
        });
    }

    pub(super) fn handle_room_list_fetched(
        &mut self,
        token: u64,
        rooms: Option<Vec<RoomEntry>>,
        error: Option<String>,
    ) {
        if token != self.session_token {
            return; // stale: the session bounced while the fetch was in flight
        }
        if let Some(err) = error {
            // Keep the last good list; the next tick retries anyway.
            tracing::warn!(err = %err, "room list fetch failed");
            return;
        }
        let Some(rooms) = rooms else { return };

        // Membership is idempotent: a room joins the relay once no matter how
        // many polls report it.
        for entry in &rooms {
            self.join_room(&entry.room_id);
        }

        let room_list: Vec<RoomSummary> = rooms
            .into_iter()
            .map(|entry| RoomSummary {
                room_id: entry.room_id,
                last_message: entry.last_message,
                last_time_label: entry.last_time,
            })
            .collect();
        if room_list != self.state.room_list {
            self.state.room_list = room_list;
            self.emit_room_list();
        }
    }

    /// A directed call offer arrived. The frame carries no room id, so it is
    /// reconstructed from the caller id and our own identity.
    pub(super) fn handle_call_received(&mut self, signal: Value, from: String) {
        let Some(offer) = SignalBundle::from_value(&signal) else {
            tracing::debug!(from = %from, "dropping call offer with unreadable signal");
            return;
        };
        if self.has_live_call() {
            // The relay contract has no busy signal; the offer is dropped and
            // the caller keeps ringing until they give up.
            tracing::info!(from = %from, "busy; dropping incoming call offer");
            return;
        }
        let room_id = self.room_with(&from);
        self.pending_incoming = Some(PendingIncoming {
            room_id: room_id.clone(),
            caller_id: from.clone(),
            offer,
        });
        self.state.incoming_call = Some(IncomingCallPrompt {
            room_id,
            caller_id: from,
        });
        self.emit_state();
    }

    pub(super) fn handle_dismiss_incoming_call(&mut self) {
        // Local-only: there is no reject frame, the caller just keeps ringing.
        self.pending_incoming = None;
        if self.state.incoming_call.take().is_some() {
            self.emit_state();
        }
    }
}
