use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Structured API-key prefix. Full shape:
/// `sk_agent_v1_{tenant_prefix_8}_{agent_uuid}_{random_hex_8}`.
pub const KEY_PREFIX: &str = "sk_agent_v1_";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Human,
    Agent,
}

/// Authenticated identity attached to every invocation by the transport
/// layer. Immutable for the lifetime of the request.
#[derive(Debug, Serialize, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub actor_id: String,
    pub actor_kind: ActorKind,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedApiKey {
    pub tenant_prefix: String,
    pub agent_id: String,
    pub nonce: String,
}

/// Mint a clear-text key for a tenant. Returns `(clear_text, agent_id)`;
/// the agent id doubles as the stored key id.
pub fn generate_api_key(tenant_id: &str) -> (String, String) {
    let prefix: String = tenant_id.chars().take(8).collect();
    let agent_id = uuid::Uuid::new_v4().to_string();
    let nonce = format!("{:08x}", uuid::Uuid::new_v4().as_u128() as u32);
    (
        format!("{KEY_PREFIX}{prefix}_{agent_id}_{nonce}"),
        agent_id,
    )
}

/// Extract the structured parts without a store lookup. The tenant prefix
/// may itself contain underscores, so parsing anchors on the fixed-width
/// fields from the right.
pub fn parse_api_key(key: &str) -> Option<ParsedApiKey> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    let (head, nonce) = rest.rsplit_once('_')?;
    let (tenant_prefix, agent_id) = head.rsplit_once('_')?;
    if nonce.len() != 8 || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if tenant_prefix.is_empty() || uuid::Uuid::parse_str(agent_id).is_err() {
        return None;
    }
    Some(ParsedApiKey {
        tenant_prefix: tenant_prefix.to_string(),
        agent_id: agent_id.to_string(),
        nonce: nonce.to_string(),
    })
}

/// HMAC-SHA256 digest of the clear text under the server pepper, hex-encoded.
pub fn digest_key(pepper: &str, clear: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(pepper.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(clear.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison against a stored digest.
pub fn verify_key(pepper: &str, clear: &str, stored_digest: &str) -> bool {
    let Ok(expected) = hex::decode(stored_digest) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(pepper.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(clear.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
