//! Records kept in the state store

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, Result};

/// One subscriber's interest in one resource's state for one event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// AOR of the watcher (From)
    pub subscriber: String,
    /// AOR of the watched resource (To)
    pub resource: String,
    pub event: String,
    /// `id` parameter of the Event header
    pub id: Option<String>,
    pub call_id: Option<String>,
    pub accept: Option<String>,
    /// Negotiated lifetime in seconds
    pub expires: u32,
    pub etag: Option<String>,
}

impl Subscription {
    pub fn new(
        subscriber: impl Into<String>,
        resource: impl Into<String>,
        event: impl Into<String>,
        expires: u32,
    ) -> Self {
        Self {
            subscriber: subscriber.into(),
            resource: resource.into(),
            event: event.into(),
            id: None,
            call_id: None,
            accept: None,
            expires,
            etag: None,
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_accept(mut self, accept: Option<String>) -> Self {
        self.accept = accept;
        self
    }

    /// Event header value for NOTIFYs of this subscription
    pub fn event_header(&self) -> String {
        match &self.id {
            Some(id) => format!("{};id={}", self.event, id),
            None => self.event.clone(),
        }
    }

    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("subscriber".to_string(), self.subscriber.clone()),
            ("resource".to_string(), self.resource.clone()),
            ("event".to_string(), self.event.clone()),
            ("expires".to_string(), self.expires.to_string()),
        ];
        let optional = [
            ("id", &self.id),
            ("callId", &self.call_id),
            ("accept", &self.accept),
            ("etag", &self.etag),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name.to_string(), value.clone()));
            }
        }
        fields
    }

    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            subscriber: required(fields, "subscriber")?,
            resource: required(fields, "resource")?,
            event: required(fields, "event")?,
            id: fields.get("id").cloned(),
            call_id: fields.get("callId").cloned(),
            accept: fields.get("accept").cloned(),
            expires: required(fields, "expires")?
                .parse()
                .map_err(|_| NotifyError::Store("subscription expires is not a number".into()))?,
            etag: fields.get("etag").cloned(),
        })
    }
}

/// Current published state of one resource for one event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventState {
    pub resource: String,
    pub event: String,
    pub etag: String,
    pub content_type: String,
    pub content: String,
    pub expires: u64,
}

impl EventState {
    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("aor".to_string(), self.resource.clone()),
            ("eventType".to_string(), self.event.clone()),
            ("etag".to_string(), self.etag.clone()),
            ("contentType".to_string(), self.content_type.clone()),
            ("content".to_string(), self.content.clone()),
            ("expires".to_string(), self.expires.to_string()),
        ]
    }

    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            resource: required(fields, "aor")?,
            event: required(fields, "eventType")?,
            etag: required(fields, "etag")?,
            content_type: required(fields, "contentType")?,
            content: fields.get("content").cloned().unwrap_or_default(),
            expires: fields
                .get("expires")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        })
    }
}

/// Direction of a dialog relative to the watched resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogDirection {
    Initiator,
    Recipient,
}

impl DialogDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogDirection::Initiator => "initiator",
            DialogDirection::Recipient => "recipient",
        }
    }
}

impl FromStr for DialogDirection {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "initiator" | "outbound" => Ok(DialogDirection::Initiator),
            "recipient" | "inbound" => Ok(DialogDirection::Recipient),
            other => Err(NotifyError::Internal(format!("unknown dialog direction: {}", other))),
        }
    }
}

impl fmt::Display for DialogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call state carried in dialog events (RFC 4235 §3.7.1 plus the
/// terminal variants publishers report)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogCallState {
    Trying,
    Proceeding,
    Early,
    Confirmed,
    Terminated,
    Rejected,
    Cancelled,
}

impl DialogCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogCallState::Trying => "trying",
            DialogCallState::Proceeding => "proceeding",
            DialogCallState::Early => "early",
            DialogCallState::Confirmed => "confirmed",
            DialogCallState::Terminated => "terminated",
            DialogCallState::Rejected => "rejected",
            DialogCallState::Cancelled => "cancelled",
        }
    }

    /// terminated, rejected and cancelled end the dialog
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DialogCallState::Terminated | DialogCallState::Rejected | DialogCallState::Cancelled
        )
    }
}

impl FromStr for DialogCallState {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trying" => Ok(DialogCallState::Trying),
            "proceeding" => Ok(DialogCallState::Proceeding),
            "early" => Ok(DialogCallState::Early),
            "confirmed" => Ok(DialogCallState::Confirmed),
            "terminated" => Ok(DialogCallState::Terminated),
            "rejected" => Ok(DialogCallState::Rejected),
            "cancelled" | "canceled" => Ok(DialogCallState::Cancelled),
            other => Err(NotifyError::Internal(format!("unknown dialog state: {}", other))),
        }
    }
}

impl fmt::Display for DialogCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call-state snapshot for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogInfo {
    pub aor: String,
    pub id: String,
    pub call_id: String,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    pub direction: DialogDirection,
    pub state: DialogCallState,
}

impl DialogInfo {
    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("callId".to_string(), self.call_id.clone()),
            ("direction".to_string(), self.direction.to_string()),
            ("state".to_string(), self.state.to_string()),
        ];
        if let Some(tag) = &self.local_tag {
            fields.push(("localTag".to_string(), tag.clone()));
        }
        if let Some(tag) = &self.remote_tag {
            fields.push(("remoteTag".to_string(), tag.clone()));
        }
        fields
    }

    pub(crate) fn from_fields(aor: &str, fields: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            aor: aor.to_string(),
            id: required(fields, "id")?,
            call_id: required(fields, "callId")?,
            local_tag: fields.get("localTag").cloned(),
            remote_tag: fields.get("remoteTag").cloned(),
            direction: required(fields, "direction")?.parse()?,
            state: required(fields, "state")?.parse()?,
        })
    }
}

/// Reachable contact for a user, kept alongside subscription state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub aor: String,
    pub contact: String,
    pub transport: String,
    /// Proxy instance that owns the registration
    pub proxy: String,
    pub expires: u32,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("contact".to_string(), self.contact.clone()),
            ("transport".to_string(), self.transport.clone()),
            ("proxy".to_string(), self.proxy.clone()),
            ("expires".to_string(), self.expires.to_string()),
            ("registeredAt".to_string(), self.registered_at.to_rfc3339()),
        ]
    }

    pub(crate) fn from_fields(aor: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let registered_at = fields
            .get("registeredAt")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Self {
            aor: aor.to_string(),
            contact: required(fields, "contact")?,
            transport: fields.get("transport").cloned().unwrap_or_else(|| "udp".to_string()),
            proxy: fields.get("proxy").cloned().unwrap_or_default(),
            expires: fields
                .get("expires")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            registered_at,
        })
    }
}

fn required(fields: &HashMap<String, String>, name: &str) -> Result<String> {
    fields
        .get(name)
        .cloned()
        .ok_or_else(|| NotifyError::Store(format!("record is missing field '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_event_header_carries_id() {
        let plain = Subscription::new("bob@x", "alice@x", "dialog", 60);
        assert_eq!(plain.event_header(), "dialog");
        let with_id = plain.with_id(Some("7".to_string()));
        assert_eq!(with_id.event_header(), "dialog;id=7");
    }

    #[test]
    fn test_subscription_fields_skip_absent_optionals() {
        let sub = Subscription::new("bob@example.com", "alice@example.com", "presence", 600)
            .with_call_id("c1");
        let fields = sub.to_fields();
        assert!(fields.iter().any(|(k, v)| k == "callId" && v == "c1"));
        assert!(!fields.iter().any(|(k, _)| k == "id" || k == "accept"));

        let map: HashMap<String, String> = fields.into_iter().collect();
        assert_eq!(Subscription::from_fields(&map).unwrap(), sub);
    }

    #[test]
    fn test_dialog_states() {
        assert!("Rejected".parse::<DialogCallState>().unwrap().is_terminal());
        assert!("canceled".parse::<DialogCallState>().unwrap().is_terminal());
        assert!(!"confirmed".parse::<DialogCallState>().unwrap().is_terminal());
        assert!("ringing".parse::<DialogCallState>().is_err());
        assert_eq!("inbound".parse::<DialogDirection>().unwrap(), DialogDirection::Recipient);
    }

    #[test]
    fn test_missing_field_is_store_error() {
        let map = HashMap::from([("id".to_string(), "d1".to_string())]);
        assert!(matches!(
            DialogInfo::from_fields("alice@example.com", &map),
            Err(NotifyError::Store(_))
        ));
    }
}
