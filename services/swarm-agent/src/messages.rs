//! Peer protocol message tags and bodies.
//!
//! Tags are case-sensitive. Bodies are free-form JSON objects.

use serde_json::{json, Value};
use swarm_overlay::Body;

use crate::config::ResourceRequest;

/// Ask a peer for an application's state. Body: `{appid}`.
pub const MSG_GETSTATE: &str = "MSG_GETSTATE";

/// Reply to [`MSG_GETSTATE`]. Body: `{appid, state}`.
pub const MSG_STATE: &str = "MSG_STATE";

/// Leader to authority resource request. Body: `{cpu[, memory]}`.
pub const MSG_RESOURCE_REQUEST: &str = "MSG_RESOURCE_REQUEST";

/// Authority to leader provisioning notice. Body: `{appid}`.
pub const MSG_RESOURCE_RESPONSE: &str = "MSG_RESOURCE_RESPONSE";

/// State reported for every application this agent serves.
pub const STATE_RUNNING: &str = "running";

pub fn get_state(appid: &str) -> Body {
    object(json!({ "appid": appid }))
}

/// A state reply echoing the requested `appid` value as-is.
pub fn state(appid: Value, state: &str) -> Body {
    object(json!({ "appid": appid, "state": state }))
}

pub fn resource_request(request: &ResourceRequest) -> Body {
    let mut body = object(json!({ "cpu": request.cpu }));
    if let Some(memory) = &request.memory {
        body.insert("memory".to_string(), json!(memory));
    }
    body
}

pub fn resource_response(appid: &str) -> Body {
    object(json!({ "appid": appid }))
}

/// The `appid` field rendered for logs.
pub fn appid(body: &Body) -> String {
    match body.get("appid") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "<none>".to_string(),
    }
}

fn object(value: Value) -> Body {
    match value {
        Value::Object(map) => map,
        _ => Body::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_request_body() {
        let body = resource_request(&ResourceRequest::default());
        assert_eq!(Value::Object(body), json!({"cpu": "2"}));

        let body = resource_request(&ResourceRequest {
            cpu: "4".into(),
            memory: Some("8Gi".into()),
        });
        assert_eq!(Value::Object(body), json!({"cpu": "4", "memory": "8Gi"}));
    }

    #[test]
    fn test_state_echoes_appid_value() {
        let body = state(json!(17), STATE_RUNNING);
        assert_eq!(Value::Object(body), json!({"appid": 17, "state": "running"}));
    }

    #[test]
    fn test_appid_for_logs() {
        assert_eq!(appid(&get_state("app-1")), "app-1");
        assert_eq!(appid(&Body::new()), "<none>");
    }
}
