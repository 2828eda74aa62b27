#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bargain_core::{AppReconciler, AppUpdate, MessageStore, RoomEntry, StoredMessage};
use futures_util::future::BoxFuture;

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

pub fn write_offline_config(data_dir: &str) {
    let path = std::path::Path::new(data_dir).join("bargain_config.json");
    let v = serde_json::json!({
        "disable_network": true,
        "call_audio_backend": "synthetic",
        "room_poll_secs": 1,
    });
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

pub fn write_relay_config(data_dir: &str, relay_url: &str) {
    let path = std::path::Path::new(data_dir).join("bargain_config.json");
    let v = serde_json::json!({
        "disable_network": false,
        "relay_url": relay_url,
        "call_audio_backend": "synthetic",
        "room_poll_secs": 1,
    });
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

pub struct TestReconciler {
    updates: Arc<Mutex<Vec<AppUpdate>>>,
}

impl TestReconciler {
    pub fn new() -> (Self, Arc<Mutex<Vec<AppUpdate>>>) {
        let updates = Arc::new(Mutex::new(vec![]));
        (
            Self {
                updates: updates.clone(),
            },
            updates,
        )
    }
}

impl AppReconciler for TestReconciler {
    fn reconcile(&self, update: AppUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// In-memory store, shared between the apps in a test the way the deployed
/// store is shared between clients. Ids are assigned `m1`, `m2`, ... in
/// append order.
pub struct MockStore {
    inner: Mutex<MockStoreInner>,
}

#[derive(Default)]
struct MockStoreInner {
    next_id: u64,
    history: HashMap<String, Vec<StoredMessage>>,
    room_index: HashMap<String, Vec<RoomEntry>>,
    fail_appends: bool,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MockStoreInner::default()),
        })
    }

    /// Preload one already-persisted message.
    pub fn seed_message(&self, room_id: &str, sender_id: &str, text: &str, time: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("m{}", inner.next_id);
        inner
            .history
            .entry(room_id.to_string())
            .or_default()
            .push(StoredMessage {
                persisted_id: Some(id.clone()),
                room_id: room_id.to_string(),
                sender_id: sender_id.to_string(),
                text: text.to_string(),
                time: time.to_string(),
            });
        id
    }

    /// Add a room to a party's active-room index.
    pub fn seed_room(&self, party_id: &str, room_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .room_index
            .entry(party_id.to_string())
            .or_default()
            .push(RoomEntry {
                room_id: room_id.to_string(),
                last_message: None,
                last_time: None,
            });
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.inner.lock().unwrap().fail_appends = fail;
    }

    pub fn messages_in(&self, room_id: &str) -> Vec<StoredMessage> {
        self.inner
            .lock()
            .unwrap()
            .history
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl MessageStore for MockStore {
    fn fetch_history(
        &self,
        room_id: &str,
    ) -> BoxFuture<'static, anyhow::Result<Vec<StoredMessage>>> {
        let result = self.messages_in(room_id);
        Box::pin(async move { Ok(result) })
    }

    fn append_message(
        &self,
        message: StoredMessage,
    ) -> BoxFuture<'static, anyhow::Result<StoredMessage>> {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_appends {
                Err(anyhow::anyhow!("store rejected append"))
            } else {
                inner.next_id += 1;
                let id = format!("m{}", inner.next_id);
                let mut saved = message;
                saved.persisted_id = Some(id);
                inner
                    .history
                    .entry(saved.room_id.clone())
                    .or_default()
                    .push(saved.clone());
                // Keep every party's index preview in step, like the real
                // store does on write.
                for entries in inner.room_index.values_mut() {
                    for entry in entries.iter_mut().filter(|e| e.room_id == saved.room_id) {
                        entry.last_message = Some(saved.text.clone());
                        entry.last_time = Some(saved.time.clone());
                    }
                }
                Ok(saved)
            }
        };
        Box::pin(async move { result })
    }

    fn list_active_rooms(
        &self,
        party_id: &str,
    ) -> BoxFuture<'static, anyhow::Result<Vec<RoomEntry>>> {
        let result = self
            .inner
            .lock()
            .unwrap()
            .room_index
            .get(party_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(result) })
    }
}
