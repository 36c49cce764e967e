use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::fabric::FabricError;

/*──────────────────────── wire envelopes (JSON) ───────────────────────*/

/// Pub/sub log entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PubEnvelope {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// `None` for fire-and-forget unicast requests.
    #[serde(default)]
    pub reply_to: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcReply {
    pub id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    /// Set by fanout servers so the client can aggregate per source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RpcReply {
    pub fn ok(id: String, result: Value, source: Option<String>) -> Self {
        Self {
            id,
            result,
            error: None,
            source,
        }
    }

    pub fn err(id: String, error: String, source: Option<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error),
            source,
        }
    }
}

pub fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>, FabricError> {
    serde_json::to_vec(v).map_err(|e| FabricError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FabricError> {
    serde_json::from_slice(bytes).map_err(|e| FabricError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = RpcRequest {
            id: "r1".into(),
            method: "mgmtbus_status".into(),
            params: json!({}),
            reply_to: Some("mbus:bus:reply".into()),
        };
        let v: Value = serde_json::from_slice(&encode(&req).unwrap()).unwrap();
        assert_eq!(
            v,
            json!({"id": "r1", "method": "mgmtbus_status", "params": {}, "reply_to": "mbus:bus:reply"})
        );
    }

    #[test]
    fn unicast_reply_omits_source() {
        let v: Value =
            serde_json::from_slice(&encode(&RpcReply::ok("x".into(), json!(1), None)).unwrap())
                .unwrap();
        assert_eq!(v, json!({"id": "x", "result": 1, "error": null}));
    }

    #[test]
    fn missing_params_default_to_null() {
        let env: PubEnvelope = decode(br#"{"method":"log"}"#).unwrap();
        assert_eq!(env.params, Value::Null);
        assert!(decode::<PubEnvelope>(b"not json").is_err());
    }
}
