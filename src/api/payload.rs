//! Wire shapes for the `getUpdates` long-poll call: the update envelope handed
//! to bots, the JSON request body, and the `{"ok": ..}` response decoder.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One event delivered by the remote service.
///
/// Only `update_id` is interpreted; every other field of the JSON object is kept
/// verbatim in the payload so bots can decode the parts they care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    update_id: i64,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl Update {
    pub fn new(update_id: i64, payload: Map<String, Value>) -> Self {
        Self { update_id, payload }
    }

    /// Builds an update with an empty payload. Mostly useful for fakes.
    pub fn with_id(update_id: i64) -> Self {
        Self::new(update_id, Map::new())
    }

    pub fn id(&self) -> i64 {
        self.update_id
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Name of the first payload field (`"message"`, `"callback_query"`, ...).
    pub fn kind(&self) -> Option<&str> {
        self.payload.keys().next().map(String::as_str)
    }

    pub fn into_payload(self) -> Map<String, Value> {
        self.payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct GetUpdatesBody {
    pub(crate) offset: i64,
    pub(crate) limit: u32,
    pub(crate) timeout: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) allowed_updates: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    #[serde(default)]
    result: Option<Vec<Update>>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum DecodedResponse {
    Updates(Vec<Update>),
    Rejected {
        code: Option<i64>,
        description: String,
    },
}

pub(crate) fn decode_updates(body: &[u8]) -> serde_json::Result<DecodedResponse> {
    let envelope: ApiEnvelope = serde_json::from_slice(body)?;

    if !envelope.ok {
        return Ok(DecodedResponse::Rejected {
            code: envelope.error_code,
            description: envelope
                .description
                .unwrap_or_else(|| "request rejected without description".to_owned()),
        });
    }

    match envelope.result {
        Some(updates) => Ok(DecodedResponse::Updates(updates)),
        None => Err(serde_json::Error::custom(
            "successful getUpdates response is missing `result`",
        )),
    }
}
