use serde::Serialize;

/// Every public broker operation returns either success or exactly one of
/// these. Errors are plain values; internal retries stay inside the component
/// that owns the failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    IsolationViolation(String),
    #[error("mailbox full for session {recipient} (capacity {capacity})")]
    QueueFull { recipient: String, capacity: usize },
    #[error("{0}")]
    ProtocolIncompatible(String),
    #[error("rate limited: {message}")]
    RateLimited { message: String, retry_after_secs: u64 },
    /// Intentionally generic: no distinction between unknown tenant and wrong key.
    #[error("invalid or missing credentials")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("store degraded: {0}")]
    DegradedStore(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable kind string, serialized alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Validation(_) => "validation_error",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::Conflict(_) => "conflict",
            BrokerError::IsolationViolation(_) => "isolation_violation",
            BrokerError::QueueFull { .. } => "queue_full",
            BrokerError::ProtocolIncompatible(_) => "protocol_incompatible",
            BrokerError::RateLimited { .. } => "rate_limited",
            BrokerError::Unauthorized => "unauthorized",
            BrokerError::Forbidden(_) => "forbidden",
            BrokerError::Cancelled => "cancelled",
            BrokerError::DegradedStore(_) => "degraded_store",
            BrokerError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::Validation(_) => 400,
            BrokerError::NotFound(_) => 404,
            BrokerError::Conflict(_) => 409,
            BrokerError::IsolationViolation(_) => 403,
            BrokerError::QueueFull { .. } => 409,
            BrokerError::ProtocolIncompatible(_) => 409,
            BrokerError::RateLimited { .. } => 429,
            BrokerError::Unauthorized => 401,
            BrokerError::Forbidden(_) => 403,
            BrokerError::Cancelled => 408,
            BrokerError::DegradedStore(_) => 503,
            BrokerError::Internal(_) => 500,
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let BrokerError::RateLimited { retry_after_secs, .. } = self {
            body["retry_after_secs"] = serde_json::json!(retry_after_secs);
        }
        body
    }
}

impl Serialize for BrokerError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_body().serialize(serializer)
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Internal(e.to_string())
    }
}
