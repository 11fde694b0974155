use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// --- Tenants / projects ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
}

/// Rule a tenant declares about a peer tenant. Cross-tenant routing requires
/// both sides to have declared the other; the protocol whitelists intersect.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrossTenantRule {
    pub peer: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Messages per minute allowed to this peer. Zero disables the pair.
    #[serde(default)]
    pub rate_per_minute: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TenantConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_protocols: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox_capacity: Option<usize>,
    #[serde(default = "default_true")]
    pub discoverable: bool,
    #[serde(default)]
    pub cross_tenant: Vec<CrossTenantRule>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            max_sessions: None,
            max_protocols: None,
            mailbox_capacity: None,
            discoverable: true,
            cross_tenant: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Tenant {
    pub tenant_id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub status: TenantStatus,
    #[serde(default)]
    pub config: TenantConfig,
    pub created_at: String,
    pub last_activity: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Expired,
}

/// Stored API-key record. Only the digest is persisted; the clear text is
/// shown once at creation or rotation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiKey {
    pub key_id: String,
    pub tenant_id: String,
    pub digest: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Set when a rotation superseded this key; it keeps authenticating
    /// until this deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_until: Option<String>,
    pub created_at: String,
}

// --- Protocols ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessagePattern {
    PointToPoint,
    Broadcast,
    RequestResponse,
    Streaming,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ProtocolMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A registered protocol. Immutable after registration apart from the
/// `shared` opt-in flag; a new version is a new record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProtocolDefinition {
    pub tenant_id: String,
    pub name: String,
    pub version: String,
    pub schema: serde_json::Value,
    pub capabilities: Vec<MessagePattern>,
    #[serde(default)]
    pub metadata: ProtocolMetadata,
    #[serde(default)]
    pub shared: bool,
    pub registered_at: String,
}

/// Discovery/summary view of a protocol. `origin_tenant` is set only on
/// entries reached through cross-tenant sharing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProtocolInfo {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<MessagePattern>,
    #[serde(default)]
    pub metadata: ProtocolMetadata,
    pub registered_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_tenant: Option<String>,
}

impl ProtocolDefinition {
    pub fn info(&self, caller_tenant: &str) -> ProtocolInfo {
        ProtocolInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            capabilities: self.capabilities.clone(),
            metadata: self.metadata.clone(),
            registered_at: self.registered_at.clone(),
            origin_tenant: if self.tenant_id == caller_tenant {
                None
            } else {
                Some(self.tenant_id.clone())
            },
        }
    }
}

// --- Sessions ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stale,
    Disconnected,
}

/// What a session advertises: supported versions per protocol name, plus a
/// flat set of feature tags. BTree containers keep negotiation output
/// deterministic.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SessionCapabilities {
    #[serde(default)]
    pub protocols: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub features: BTreeSet<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Session {
    pub session_id: String,
    pub tenant_id: String,
    pub connected_at: String,
    pub last_heartbeat: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<SessionCapabilities>,
    pub queue_depth: usize,
}

// --- Messages ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MessageHeaders {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Provenance for messages routed across tenants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_tenant: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cross_tenant: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub message_id: String,
    pub tenant_id: String,
    pub sender_session: String,
    /// None for fan-out envelopes; each delivered copy carries the recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_session: Option<String>,
    pub protocol_name: String,
    pub protocol_version: String,
    /// Version the payload was authored against, when an adapter rewrote it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_version: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: MessageHeaders,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
    pub failed_at: String,
    pub sender: String,
    pub intended_recipient: String,
}

// --- Requests ---

#[derive(Debug, Deserialize)]
pub struct ConnectSession {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub capabilities: SessionCapabilities,
}

#[derive(Debug, Deserialize)]
pub struct RegisterProtocol {
    pub name: String,
    pub version: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<MessagePattern>,
    #[serde(default)]
    pub metadata: Option<ProtocolMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct ShareProtocol {
    pub name: String,
    pub version: String,
    #[serde(default = "default_true")]
    pub shared: bool,
}

#[derive(Debug, Deserialize)]
pub struct RequiredProtocol {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct NegotiateRequest {
    /// Two or more participants. The pairwise matrix form is returned when
    /// `matrix` is set.
    pub session_ids: Vec<String>,
    #[serde(default)]
    pub required_protocols: Vec<RequiredProtocol>,
    #[serde(default)]
    pub matrix: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_session: String,
    pub recipient_session: String,
    /// Set only for cross-tenant sends; requires mutual consent rules.
    #[serde(default)]
    pub recipient_tenant: Option<String>,
    pub protocol_name: String,
    pub protocol_version: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub sender_session: String,
    pub protocol_name: String,
    pub protocol_version: String,
    pub payload: serde_json::Value,
    /// Feature requirements: `{"encryption": true}` keeps only sessions that
    /// advertise the feature, `false` keeps only those that do not.
    #[serde(default)]
    pub capability_filter: Option<BTreeMap<String, bool>>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DrainRequest {
    #[serde(default = "default_drain_limit")]
    pub max_messages: usize,
}

fn default_drain_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct CreateProject {
    pub tenant_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: Option<TenantConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RotateKeys {
    #[serde(default = "default_grace_secs")]
    pub grace_period_secs: i64,
}

fn default_grace_secs() -> i64 {
    3600
}

// --- Responses ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Queued,
    QueueFull,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SendReceipt {
    pub message_id: String,
    pub delivered: bool,
    pub queued: bool,
    pub queue_full: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    /// Present and true when the store accepted the write in degraded mode.
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub degraded: bool,
}

impl SendReceipt {
    pub fn new(message_id: String, status: DeliveryStatus) -> Self {
        Self {
            message_id,
            delivered: status == DeliveryStatus::Delivered,
            queued: status == DeliveryStatus::Queued,
            queue_full: status == DeliveryStatus::QueueFull,
            depth: None,
            at: None,
            degraded: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FailedDelivery {
    pub session_id: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BroadcastSummary {
    pub delivered_count: usize,
    pub delivered: Vec<String>,
    pub queued: Vec<String>,
    pub failed: Vec<FailedDelivery>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Incompatibility {
    pub protocol: String,
    /// Advertised versions per participating session.
    pub versions: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NegotiationResult {
    pub compatible: bool,
    pub supported_protocols: BTreeMap<String, String>,
    pub common_features: BTreeSet<String>,
    pub missing_features: BTreeMap<String, BTreeSet<String>>,
    pub incompatibilities: Vec<Incompatibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PairwiseEntry {
    pub a: String,
    pub b: String,
    pub result: NegotiationResult,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DrainResponse {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub count: usize,
    pub remaining: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProjectCreated {
    pub tenant: Tenant,
    /// Shown exactly once; only the digest is stored.
    pub api_key: String,
    pub key_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeysRotated {
    pub tenant_id: String,
    pub api_key: String,
    pub key_id: String,
    pub old_keys_valid_until: String,
}

fn default_true() -> bool {
    true
}

/// Lowercase slug used for tenant ids and protocol names: starts with a
/// letter, ends with a letter or digit, `_` allowed in between.
pub fn valid_slug(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    let last = bytes[bytes.len() - 1];
    if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
        return false;
    }
    bytes[1..bytes.len() - 1]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_')
}
