use anyhow::Context;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// One chat message as the store persists and returns it.
///
/// `persisted_id` maps to the store's `_id`: absent on the way in, assigned by
/// the store on append, present on every history read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub persisted_id: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
    pub time: String,
}

/// One row in a party's room index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEntry {
    pub room_id: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_time: Option<String>,
}

/// Durable message store, injected behind a trait so tests can run against an
/// in-memory fake while production talks REST.
pub trait MessageStore: Send + Sync + 'static {
    fn fetch_history(&self, room_id: &str) -> BoxFuture<'static, anyhow::Result<Vec<StoredMessage>>>;

    /// Append one message; the returned copy carries the assigned id.
    fn append_message(
        &self,
        message: StoredMessage,
    ) -> BoxFuture<'static, anyhow::Result<StoredMessage>>;

    fn list_active_rooms(
        &self,
        party_id: &str,
    ) -> BoxFuture<'static, anyhow::Result<Vec<RoomEntry>>>;
}

/// REST-backed store client.
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

impl MessageStore for HttpStore {
    fn fetch_history(
        &self,
        room_id: &str,
    ) -> BoxFuture<'static, anyhow::Result<Vec<StoredMessage>>> {
        let url = format!("{}/rooms/{}/messages", self.base_url, room_id);
        let client = self.client.clone();
        Box::pin(async move {
            let resp = client
                .get(&url)
                .send()
                .await
                .context("send fetch history request")?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("failed to fetch history: {status} {text}");
            }
            resp.json().await.context("decode history response")
        })
    }

    fn append_message(
        &self,
        message: StoredMessage,
    ) -> BoxFuture<'static, anyhow::Result<StoredMessage>> {
        let url = format!("{}/rooms/{}/messages", self.base_url, message.room_id);
        let client = self.client.clone();
        Box::pin(async move {
            let resp = client
                .post(&url)
                .json(&message)
                .send()
                .await
                .context("send append message request")?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("failed to append message: {status} {text}");
            }
            resp.json().await.context("decode append response")
        })
    }

    fn list_active_rooms(
        &self,
        party_id: &str,
    ) -> BoxFuture<'static, anyhow::Result<Vec<RoomEntry>>> {
        let url = format!("{}/parties/{}/rooms", self.base_url, party_id);
        let client = self.client.clone();
        Box::pin(async move {
            let resp = client
                .get(&url)
                .send()
                .await
                .context("send list rooms request")?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("failed to list rooms: {status} {text}");
            }
            resp.json().await.context("decode room list response")
        })
    }
}
