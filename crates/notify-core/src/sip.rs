//! Interface to the SIP dialog layer
//!
//! notify-core does not parse SIP off the wire or run transactions. The
//! dialog library in front of it hands over requests in the shape defined
//! here and implements [`DialogLayer`] so the engine can answer, establish
//! subscription dialogs and send NOTIFY requests on them.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{NotifyError, Result};

/// SIP response status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const TEMPORARILY_UNAVAILABLE: StatusCode = StatusCode(480);
    pub const CALL_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const BAD_EVENT: StatusCode = StatusCode(489);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            202 => "Accepted",
            400 => "Bad Request",
            480 => "Temporarily Unavailable",
            481 => "Call/Transaction Does Not Exist",
            489 => "Bad Event",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// Compact header forms (RFC 3261 §7.3.3, RFC 3265 §7.2)
fn compact_form(name: &str) -> Option<&'static str> {
    match name {
        "event" => Some("o"),
        "call-id" => Some("i"),
        "from" => Some("f"),
        "to" => Some("t"),
        _ => None,
    }
}

/// An inbound SUBSCRIBE as handed over by the dialog layer
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub uri: String,
    pub headers: Vec<(String, String)>,
    /// Set by the dialog layer when the request arrived inside an
    /// established dialog
    pub dialog_id: Option<String>,
}

impl SipRequest {
    pub fn subscribe(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            headers: Vec::new(),
            dialog_id: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn in_dialog(mut self, dialog_id: impl Into<String>) -> Self {
        self.dialog_id = Some(dialog_id.into());
        self
    }

    /// First value of a header, matched case-insensitively and by compact form
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        let compact = compact_form(&name);
        self.headers
            .iter()
            .find(|(n, _)| {
                let n = n.to_ascii_lowercase();
                n == name || Some(n.as_str()) == compact
            })
            .map(|(_, v)| v.trim())
    }

    pub fn event(&self) -> Option<&str> {
        self.header("Event")
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn accept(&self) -> Option<&str> {
        self.header("Accept")
    }

    /// Expires header value; an unparsable value is treated as absent
    pub fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.parse().ok())
    }

    pub fn from_uri(&self) -> Result<SipUri> {
        let value = self
            .header("From")
            .ok_or_else(|| NotifyError::InvalidUri("missing From header".into()))?;
        SipUri::from_str(value)
    }

    pub fn to_uri(&self) -> Result<SipUri> {
        let value = self
            .header("To")
            .ok_or_else(|| NotifyError::InvalidUri("missing To header".into()))?;
        SipUri::from_str(value)
    }
}

/// The parts of a SIP URI an address of record is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    /// True when the host is a literal IPv4 or IPv6 address
    pub fn host_is_ip(&self) -> bool {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.parse::<IpAddr>().is_ok()
    }
}

impl FromStr for SipUri {
    type Err = NotifyError;

    /// Accepts a bare URI, `<uri>` or a full name-addr with header params
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let addr_spec = match (s.find('<'), s.find('>')) {
            (Some(start), Some(end)) if start < end => &s[start + 1..end],
            _ => s.split(';').next().unwrap_or(s),
        };

        let rest = addr_spec
            .strip_prefix("sips:")
            .or_else(|| addr_spec.strip_prefix("sip:"))
            .ok_or_else(|| NotifyError::InvalidUri(format!("not a sip uri: {}", s)))?;

        let rest = rest.split(['?', ';']).next().unwrap_or(rest);

        let (user, hostport) = match rest.rfind('@') {
            Some(at) => {
                let userinfo = &rest[..at];
                let user = userinfo.split(':').next().unwrap_or(userinfo);
                (Some(user.to_string()), &rest[at + 1..])
            }
            None => (None, rest),
        };

        let (host, port) = if hostport.starts_with('[') {
            match hostport.find(']') {
                Some(end) => {
                    let port = hostport[end + 1..]
                        .strip_prefix(':')
                        .and_then(|p| p.parse().ok());
                    (&hostport[..=end], port)
                }
                None => return Err(NotifyError::InvalidUri(format!("bad IPv6 host: {}", s))),
            }
        } else {
            match hostport.rsplit_once(':') {
                Some((h, p)) => (h, p.parse().ok()),
                None => (hostport, None),
            }
        };

        if host.is_empty() {
            return Err(NotifyError::InvalidUri(format!("empty host: {}", s)));
        }

        Ok(SipUri {
            user: user.filter(|u| !u.is_empty()),
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

/// Value of the Subscription-State header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Active { expires: Option<u32> },
    Terminated { reason: Option<String> },
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionState::Active { .. })
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Active { expires: Some(secs) } => write!(f, "active;expires={}", secs),
            SubscriptionState::Active { expires: None } => write!(f, "active"),
            SubscriptionState::Terminated { reason: Some(reason) } => {
                write!(f, "terminated;reason={}", reason)
            }
            SubscriptionState::Terminated { reason: None } => write!(f, "terminated"),
        }
    }
}

/// An outbound NOTIFY
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub call_id: String,
    pub event: String,
    pub subscription_state: SubscriptionState,
    pub content_type: Option<String>,
    pub body: Option<String>,
}

/// Handle on an established subscription dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogHandle {
    /// Opaque id the dialog layer uses to route in-dialog requests
    pub id: String,
    pub call_id: String,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    /// Transport the NOTIFY should go out on
    pub transport: Option<String>,
}

/// Operations the engine needs from the external dialog library
#[async_trait]
pub trait DialogLayer: Send + Sync {
    /// Answer `request` with a 2xx carrying `headers` and establish the
    /// subscription dialog
    async fn create_dialog(
        &self,
        request: &SipRequest,
        headers: Vec<(String, String)>,
    ) -> Result<DialogHandle>;

    /// Send a final response for `request`
    async fn respond(
        &self,
        request: &SipRequest,
        status: StatusCode,
        headers: Vec<(String, String)>,
    ) -> Result<()>;

    /// Send a NOTIFY inside the dialog identified by `dialog_id`, returning
    /// the final response status
    async fn send_notify(&self, dialog_id: &str, notify: NotifyRequest) -> Result<StatusCode>;
}
