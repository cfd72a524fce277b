//! Key naming shared with external tooling that inspects the store

/// Sorted index of event-state records scored by version tag
pub const EVENT_INDEX: &str = "event_zset";

pub fn registration(aor: &str) -> String {
    format!("reg:{}", aor)
}

pub fn event_state(aor: &str, event_type: &str) -> String {
    format!("es:{}:{}", aor, event_type)
}

pub fn subscription(opaque: &str) -> String {
    format!("sub:{}", opaque)
}

pub fn subscription_by_id(resource: &str, event_type: &str, subscriber: &str, id: &str) -> String {
    format!("subkeyid:{}:{}:{}:{}", resource, event_type, subscriber, id)
}

pub fn subscription_by_dialog(
    resource: &str,
    event_type: &str,
    subscriber: &str,
    call_id: &str,
) -> String {
    format!("subkeydlg:{}:{}:{}:{}", resource, event_type, subscriber, call_id)
}

/// Wildcard over every dialog pointer for a resource and event type
///
/// The resource and event type match literally.
pub fn subscription_by_dialog_pattern(resource: &str, event_type: &str) -> String {
    format!("subkeydlg:{}:{}:*", glob_escape(resource), glob_escape(event_type))
}

/// Escape glob metacharacters so `text` matches only itself
pub fn glob_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn dialog_info(aor: &str) -> String {
    format!("dlg-info:{}", aor)
}

pub fn watched_aor(resource: &str) -> String {
    format!("watched-aor:{}", resource)
}

pub fn dialog_subscription(subscriber: &str, resource: &str) -> String {
    format!("dlg-sub:{}-{}", subscriber, resource)
}
