//! REST path construction for the calling endpoints.

use std::fmt;

/// Reason reported when deleting a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    Released,
    Timeout,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::Released => "released",
            DeleteReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `GET /calls/config`
pub fn config() -> String {
    "/calls/config".to_string()
}

/// `POST /conversations/<convid>/call/flows`
pub fn flows(convid: &str) -> String {
    format!("/conversations/{convid}/call/flows")
}

/// `POST /conversations/<convid>/call/flows/v2`
pub fn flows_v2(convid: &str) -> String {
    format!("/conversations/{convid}/call/flows/v2")
}

/// `PUT /conversations/<convid>/call/flows/<flowid>/local_sdp`
pub fn local_sdp(convid: &str, flowid: &str) -> String {
    format!("/conversations/{convid}/call/flows/{flowid}/local_sdp")
}

/// `DELETE /conversations/<convid>/call/flows/<flowid>?reason=<reason>`
pub fn delete_flow(convid: &str, flowid: &str, reason: DeleteReason) -> String {
    format!("/conversations/{convid}/call/flows/{flowid}?reason={reason}")
}

/// `POST /conversations/<convid>/call/metrics[/<sub>]`
pub fn metrics(convid: &str, sub: Option<&str>) -> String {
    match sub {
        None => format!("/conversations/{convid}/call/metrics"),
        Some(sub) => format!("/conversations/{convid}/call/metrics/{sub}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn paths_match_the_wire_grammar() {
        assert_eq!(config(), "/calls/config");
        assert_eq!(flows("cv1"), "/conversations/cv1/call/flows");
        assert_eq!(flows_v2("cv1"), "/conversations/cv1/call/flows/v2");
        assert_eq!(
            local_sdp("cv1", "f1"),
            "/conversations/cv1/call/flows/f1/local_sdp"
        );
        assert_eq!(
            delete_flow("cv1", "f1", DeleteReason::Released),
            "/conversations/cv1/call/flows/f1?reason=released"
        );
        assert_eq!(
            delete_flow("cv1", "f1", DeleteReason::Timeout),
            "/conversations/cv1/call/flows/f1?reason=timeout"
        );
        assert_eq!(metrics("cv1", None), "/conversations/cv1/call/metrics");
        assert_eq!(
            metrics("cv1", Some("complete")),
            "/conversations/cv1/call/metrics/complete"
        );
    }
}
