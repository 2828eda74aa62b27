use serde::{Deserialize, Serialize};

pub const SDP_TYPE_OFFER: &str = "offer";
pub const SDP_TYPE_ANSWER: &str = "answer";

/// One side's session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// A single ICE candidate, field names matching how the web API serializes
/// them so bundles interoperate with browser counterparts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// The complete signal for one direction of the handshake: the description
/// plus every candidate gathered before emitting. Trickle is disabled, so
/// exactly one bundle crosses the wire per direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBundle {
    pub description: SessionDescription,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

impl SignalBundle {
    pub fn is_offer(&self) -> bool {
        self.description.kind == SDP_TYPE_OFFER
    }

    pub fn is_answer(&self) -> bool {
        self.description.kind == SDP_TYPE_ANSWER
    }

    /// Encode for transports that carry signals as opaque JSON.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
