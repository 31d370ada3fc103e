//! REST request and response bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Content type of every JSON request and response.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// `sdp_step` value of a flow that has not completed negotiation yet.
pub const SDP_STEP_PENDING: &str = "pending";

/// Direction of an SDP session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote ICE candidate as carried by the candidate events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCandidate {
    /// Candidate line (`candidate:...`).
    pub sdp: String,
    /// Media stream identification tag.
    #[serde(default)]
    pub sdp_mid: String,
    /// Index of the media description the candidate belongs to.
    pub sdp_mline_index: u32,
}

/// Who created a flow, as reported by the backend.
///
/// The wire encoding is a tri-state: the field may be absent, `null`
/// (the flow was created by our own POST), or the user id of the peer
/// that created it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Creator {
    /// Field not present; the caller decides from context.
    #[default]
    Absent,
    /// `"creator": null` — our POST created the flow.
    Ours,
    /// `"creator": "<user-id>"` — created by that user.
    Peer(String),
}

fn creator_field<'de, D>(deserializer: D) -> Result<Creator, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(match value {
        None => Creator::Ours,
        Some(id) => Creator::Peer(id),
    })
}

/// One flow in a flows POST response or a `call.flow-add` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FlowEntry {
    /// Backend-assigned flow id.
    pub id: String,
    /// User id of the remote participant.
    #[serde(default)]
    pub remote_user: Option<String>,
    /// Whether the flow is active.
    pub active: bool,
    /// Negotiation step as seen by the backend.
    #[serde(default)]
    pub sdp_step: Option<String>,
    #[serde(default, deserialize_with = "creator_field")]
    pub creator: Creator,
}

impl FlowEntry {
    /// True when the backend still reports the flow as unnegotiated.
    pub fn sdp_step_is_pending(&self) -> bool {
        match self.sdp_step.as_deref() {
            None => true,
            Some(step) => step == SDP_STEP_PENDING,
        }
    }
}

/// Body of a flows POST response and of the `call.flow-add` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowsResponse {
    #[serde(default)]
    pub flows: Vec<FlowEntry>,
}

/// A local session description, PUT to the backend or embedded in the
/// flows-v2 POST body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSdp {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Body of `POST .../call/flows/v2`: one description per remote user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostFlowsBody {
    pub sdp: BTreeMap<String, LocalSdp>,
}

/// One ICE server entry of the call configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Response body of `GET /calls/config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServerEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flow_entry_creator_absent() {
        let entry: FlowEntry =
            serde_json::from_str(r#"{"id":"f1","remote_user":"u1","active":true}"#).unwrap();
        assert_eq!(entry.creator, Creator::Absent);
        assert!(entry.sdp_step_is_pending());
    }

    #[test]
    fn flow_entry_creator_null_means_ours() {
        let entry: FlowEntry = serde_json::from_str(
            r#"{"id":"f1","remote_user":"u1","active":true,"creator":null,"sdp_step":"pending"}"#,
        )
        .unwrap();
        assert_eq!(entry.creator, Creator::Ours);
        assert!(entry.sdp_step_is_pending());
    }

    #[test]
    fn flow_entry_creator_peer() {
        let entry: FlowEntry = serde_json::from_str(
            r#"{"id":"f1","remote_user":"u1","active":false,"creator":"u2","sdp_step":"offered"}"#,
        )
        .unwrap();
        assert_eq!(entry.creator, Creator::Peer("u2".into()));
        assert!(!entry.sdp_step_is_pending());
    }

    #[test]
    fn post_flows_body_shape() {
        let mut body = PostFlowsBody::default();
        body.sdp.insert(
            "u2".into(),
            LocalSdp {
                sdp_type: SdpType::Offer,
                sdp: "v=0".into(),
            },
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["sdp"]["u2"]["type"], "offer");
        assert_eq!(json["sdp"]["u2"]["sdp"], "v=0");
    }

    #[test]
    fn call_config_decodes() {
        let cfg: CallConfig = serde_json::from_str(
            r#"{"ice_servers":[{"url":"turn:turn.example.com:3478","username":"u","credential":"c"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.ice_servers.len(), 1);
        assert_eq!(cfg.ice_servers[0].username.as_deref(), Some("u"));
    }
}
