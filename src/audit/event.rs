use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audited occurrence. Ordered by enqueue time within a producer;
/// interleaving across producers is unspecified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    /// Dotted action name, e.g. `request.begin`, `request.denied`.
    pub action: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            message: message.into(),
            subject: None,
            outcome: None,
            tenant_id: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_fields() {
        let e = AuditEvent::new("request.begin", "GET /v1/users")
            .with_subject("alice")
            .with_outcome("admitted")
            .with_tenant(Some("acme".into()));
        assert_eq!(e.action, "request.begin");
        assert_eq!(e.subject.as_deref(), Some("alice"));
        assert_eq!(e.outcome.as_deref(), Some("admitted"));
        assert_eq!(e.tenant_id.as_deref(), Some("acme"));
    }
}
