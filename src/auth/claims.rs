use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

/// User identity extracted from an agent token for per-user scoping of
/// built-in tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl UserContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            display_name: None,
        }
    }
}

/// Decode a JWT payload *without verification* — signature checking happened
/// at the edge — and read `sub` plus a best-effort display name.
pub fn decode_unverified(token: &str) -> Option<UserContext> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64.as_bytes()).ok()?;
    let claims: Value = serde_json::from_slice(&payload).ok()?;

    let user_id = claims.get("sub")?.as_str()?.to_string();
    let display_name = ["name", "preferred_username", "given_name"]
        .iter()
        .find_map(|k| claims.get(*k).and_then(Value::as_str))
        .map(str::to_string);

    Some(UserContext {
        user_id,
        display_name,
    })
}

/// Like [`decode_unverified`], falling back to an anonymous context when the
/// token is absent or unparsable.
pub fn user_context_or_anonymous(token: &str) -> UserContext {
    if token.is_empty() {
        return UserContext::anonymous();
    }
    decode_unverified(token).unwrap_or_else(UserContext::anonymous)
}
