//! JSON envelopes exchanged with the prelude's `__edge` object.

use serde::{Deserialize, Serialize};

use crate::request::GuestRequest;

#[derive(Debug, Serialize)]
pub(super) struct RequestWire<'a> {
    pub url: &'a str,
    pub method: &'a str,
    pub headers: &'a [(String, String)],
    pub body: Option<String>,
}

impl<'a> From<&'a GuestRequest> for RequestWire<'a> {
    fn from(request: &'a GuestRequest) -> Self {
        Self {
            url: &request.url,
            method: &request.method,
            headers: &request.headers,
            body: (!request.body.is_empty()).then(|| hex::encode(&request.body)),
        }
    }
}

/// Result of one `__edge` operation.
#[derive(Debug, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub(super) enum Settled<T> {
    Ok { value: T },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ResponseWire {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: BodyWire,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(super) enum BodyWire {
    Empty,
    Text { text: String },
    Binary { hex: String },
    Stream { id: u32 },
}

#[derive(Debug, Deserialize)]
pub(super) struct ChunkWire {
    pub done: bool,
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}
