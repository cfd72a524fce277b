//! AOR and header helpers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::AgentConfig;
use crate::error::{NotifyError, Result};
use crate::sip::{SipUri, StatusCode};

/// Lifetime used when neither the request nor the config names one
pub const FALLBACK_EXPIRES: u32 = 3600;

/// Canonical `user@domain` for a URI
///
/// A literal IP host is replaced by `domain_override` when one is set.
pub fn aor_from_uri(uri: &SipUri, domain_override: Option<&str>) -> Result<String> {
    let user = uri
        .user
        .as_deref()
        .ok_or_else(|| NotifyError::InvalidUri(format!("no user part in uri for host {}", uri.host)))?;

    let host = match domain_override {
        Some(domain) if uri.host_is_ip() => domain.to_ascii_lowercase(),
        _ => uri.host.clone(),
    };

    Ok(format!("{}@{}", user, host))
}

/// Split an Event header into its package name and optional `id` param
pub fn parse_event_header(value: &str) -> Result<(String, Option<String>)> {
    let mut parts = value.split(';');
    let event_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if event_type.is_empty() {
        return Err(NotifyError::validation(StatusCode::BAD_REQUEST, "empty Event header"));
    }

    let id = parts.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("id") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    });

    Ok((event_type, id))
}

/// Default subscription lifetime for an event type
pub fn default_expires(event_type: &str, config: &AgentConfig) -> u32 {
    config
        .default_expires
        .get(event_type)
        .copied()
        .unwrap_or(FALLBACK_EXPIRES)
}

static LAST_ETAG: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh version tag
///
/// Tags are decimal microsecond timestamps, strictly increasing within the
/// process, so they sort by publication order and fit an f64 score exactly.
pub fn generate_etag() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);

    let mut last = LAST_ETAG.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ETAG.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(current) => last = current,
        }
    }
}

/// Numeric score of a version tag in the sorted index
pub fn etag_score(etag: &str) -> Result<f64> {
    etag.parse::<u64>()
        .map(|v| v as f64)
        .map_err(|_| NotifyError::InvalidSubscription(format!("non-numeric etag: {}", etag)))
}
