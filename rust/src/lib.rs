mod actions;
mod core;
mod logging;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use bargain_media::{CaptureBackend, PeerFactory};
use flume::{Receiver, Sender};

use crate::core::{AppCore, SharedCaptureBackend, SharedMessageStore, SharedPeerFactory};

pub use actions::AppAction;
pub use crate::core::relay::{ClientFrame, ServerFrame};
pub use crate::core::store::{HttpStore, MessageStore, RoomEntry, StoredMessage};
pub use state::*;
pub use updates::*;

/// Default `bargain_config.json` contents, for tooling that seeds a fresh
/// data directory.
pub fn default_config_json() -> String {
    crate::core::default_app_config_json()
}

/// Receives every update the core actor emits, in emission order.
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

/// Handle to one running client core.
///
/// All mutation happens on a dedicated actor thread; this handle only queues
/// actions, reads the latest state snapshot and wires up the update listener.
pub struct App {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
    store_override: SharedMessageStore,
    capture_override: SharedCaptureBackend,
    peer_override: SharedPeerFactory,
}

impl App {
    pub fn new(data_dir: String, party_id: String, side: PartySide) -> Arc<Self> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, party_id = %party_id, ?side, "App::new() starting");

        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let (update_tx, update_rx) = flume::unbounded::<AppUpdate>();

        let shared_state = Arc::new(RwLock::new(AppState::empty(party_id.clone(), side)));
        let store_override: SharedMessageStore = Arc::new(RwLock::new(None));
        let capture_override: SharedCaptureBackend = Arc::new(RwLock::new(None));
        let peer_override: SharedPeerFactory = Arc::new(RwLock::new(None));

        let app = Arc::new(Self {
            core_tx: core_tx.clone(),
            update_rx,
            listening: AtomicBool::new(false),
            shared_state: shared_state.clone(),
            store_override: store_override.clone(),
            capture_override: capture_override.clone(),
            peer_override: peer_override.clone(),
        });

        // Actor loop thread (single threaded "app actor").
        thread::spawn(move || {
            let mut core = AppCore::new(
                update_tx,
                core_tx,
                data_dir,
                party_id,
                side,
                shared_state,
                store_override,
                capture_override,
                peer_override,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
            tracing::info!("app actor stopped");
        });

        app
    }

    /// Latest committed state snapshot.
    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(guard) => guard.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    /// Queue an action for the actor. Contract: never block the caller.
    pub fn dispatch(&self, action: AppAction) {
        if self.core_tx.send(CoreMsg::Action(action)).is_err() {
            tracing::error!("app actor is gone; action dropped");
        }
    }

    pub fn listen_for_updates(&self, reconciler: Arc<dyn AppReconciler>) {
        // Avoid multiple listeners that would split messages between them.
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("listen_for_updates called twice; ignoring");
            return;
        }
        let update_rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = update_rx.recv() {
                reconciler.reconcile(update);
            }
            tracing::info!("update listener stopped");
        });
    }

    /// Swap the message store. The session resolves this slot on `Connect`,
    /// so set it before dispatching that.
    pub fn set_message_store(&self, store: Arc<dyn MessageStore>) {
        set_slot(&self.store_override, store);
    }

    /// Swap the audio capture backend used for calls.
    pub fn set_capture_backend(&self, backend: Arc<dyn CaptureBackend>) {
        set_slot(&self.capture_override, backend);
    }

    /// Swap the peer session factory used for calls.
    pub fn set_peer_factory(&self, factory: Arc<dyn PeerFactory>) {
        set_slot(&self.peer_override, factory);
    }

    /// Feed one frame straight into the actor as if the relay pushed it.
    /// Integration tests drive chat and call flows with this while the
    /// network is disabled.
    pub fn inject_relay_frame_for_tests(&self, frame: ServerFrame) {
        let _ = self
            .core_tx
            .send(CoreMsg::Internal(Box::new(InternalEvent::RelayFrame {
                frame,
            })));
    }
}

fn set_slot<T: ?Sized>(slot: &Arc<RwLock<Option<Arc<T>>>>, value: Arc<T>) {
    match slot.write() {
        Ok(mut guard) => *guard = Some(value),
        Err(poison) => *poison.into_inner() = Some(value),
    }
}
