//! HTTP body handling shared by the fetch builtin and the executor:
//! content-type classification and a size-capped, classified body reader.

use anyhow::{Result, bail};
use reqwest::Response;
use serde_json::Value;

/// Whether a content type denotes text the agent can consume inline.
pub fn is_text_content(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("xml")
        || ct.contains("javascript")
        || ct.contains("x-www-form-urlencoded")
}

pub fn is_json_content(content_type: &str) -> bool {
    content_type.to_lowercase().contains("json")
}

/// A response body classified by its content type.
#[derive(Debug)]
pub enum FetchedBody {
    /// `application/json` (parsed; unparsable JSON degrades to `Text`).
    Json(Value),
    /// Other textual types, lossily decoded.
    Text(String),
    /// Everything else, raw.
    Binary(Vec<u8>),
}

/// Outcome of [`read_classified`].
#[derive(Debug)]
pub struct FetchedResponse {
    pub status: u16,
    pub content_type: String,
    pub size_bytes: usize,
    /// The body hit the byte cap and was cut off.
    pub truncated: bool,
    pub body: FetchedBody,
}

/// Read a response body under `max_bytes` and classify it.
///
/// A `Content-Length` over the cap is rejected outright; without the header
/// the body streams with a running counter and is truncated at the cap
/// (raw, no marker, so binary content survives). Classification follows the
/// content type: JSON is parsed, text is decoded, anything else stays bytes.
pub async fn read_classified(resp: Response, max_bytes: usize) -> Result<FetchedResponse> {
    if let Some(declared) = resp.content_length() {
        if declared as usize > max_bytes {
            bail!(
                "response body of {} bytes exceeds the {} byte limit",
                declared,
                max_bytes
            );
        }
    }

    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut bytes: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut stream = resp;
    while let Some(chunk) = stream.chunk().await? {
        if bytes.len() + chunk.len() <= max_bytes {
            bytes.extend_from_slice(&chunk);
            continue;
        }
        bytes.extend_from_slice(&chunk[..max_bytes - bytes.len()]);
        truncated = true;
        break;
    }

    let size_bytes = bytes.len();
    let body = if is_json_content(&content_type) {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        match serde_json::from_str(&text) {
            Ok(value) => FetchedBody::Json(value),
            Err(_) => FetchedBody::Text(text),
        }
    } else if is_text_content(&content_type) {
        FetchedBody::Text(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        FetchedBody::Binary(bytes)
    };

    Ok(FetchedResponse {
        status,
        content_type,
        size_bytes,
        truncated,
        body,
    })
}
