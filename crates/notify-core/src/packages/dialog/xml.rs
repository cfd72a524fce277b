//! dialog-info document generation (RFC 4235)

use std::fmt::Display;
use std::io::Cursor;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::error::{NotifyError, Result};
use crate::types::{DialogCallState, DialogInfo};

pub const DIALOG_INFO_NS: &str = "urn:ietf:params:xml:ns:dialog-info";

fn xml_error(e: impl Display) -> NotifyError {
    NotifyError::Xml(e.to_string())
}

/// Render a full-state dialog-info document for `entity`
///
/// With no `dialog` the document reports an idle resource.
pub fn render_dialog_info(entity: &str, version: u64, dialog: Option<&DialogInfo>) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;

    let version = version.to_string();
    let mut root = BytesStart::new("dialog-info");
    root.push_attribute(("xmlns", DIALOG_INFO_NS));
    root.push_attribute(("version", version.as_str()));
    root.push_attribute(("state", "full"));
    root.push_attribute(("entity", entity));
    writer.write_event(Event::Start(root)).map_err(xml_error)?;

    if let Some(info) = dialog {
        let mut element = BytesStart::new("dialog");
        element.push_attribute(("id", info.id.as_str()));
        element.push_attribute(("call-id", info.call_id.as_str()));
        if let Some(tag) = &info.local_tag {
            element.push_attribute(("local-tag", tag.as_str()));
        }
        if let Some(tag) = &info.remote_tag {
            element.push_attribute(("remote-tag", tag.as_str()));
        }
        element.push_attribute(("direction", info.direction.as_str()));
        writer.write_event(Event::Start(element)).map_err(xml_error)?;

        // rejected and cancelled are reported as terminated with the cause
        // in the event attribute
        let mut state = BytesStart::new("state");
        let state_text = match info.state {
            DialogCallState::Rejected | DialogCallState::Cancelled => {
                state.push_attribute(("event", info.state.as_str()));
                DialogCallState::Terminated.as_str()
            }
            other => other.as_str(),
        };
        writer.write_event(Event::Start(state)).map_err(xml_error)?;
        writer
            .write_event(Event::Text(BytesText::new(state_text)))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new("state")))
            .map_err(xml_error)?;

        writer
            .write_event(Event::End(BytesEnd::new("dialog")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("dialog-info")))
        .map_err(xml_error)?;

    let xml = writer.into_inner().into_inner();
    String::from_utf8(xml).map_err(xml_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DialogDirection;
    use quick_xml::Reader;

    fn confirmed_call() -> DialogInfo {
        DialogInfo {
            aor: "alice@example.com".to_string(),
            id: "d-1".to_string(),
            call_id: "a84b4c76e66710@pc33".to_string(),
            local_tag: Some("1928301774".to_string()),
            remote_tag: None,
            direction: DialogDirection::Initiator,
            state: DialogCallState::Confirmed,
        }
    }

    /// (entity, version, number of <dialog> elements)
    fn summarize(xml: &str) -> (String, String, usize) {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut entity = String::new();
        let mut version = String::new();
        let mut dialogs = 0;
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"dialog-info" => {
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value).to_string();
                            match attr.key.as_ref() {
                                b"entity" => entity = value,
                                b"version" => version = value,
                                _ => {}
                            }
                        }
                    }
                    b"dialog" => dialogs += 1,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => panic!("invalid xml: {}", e),
                _ => {}
            }
        }
        (entity, version, dialogs)
    }

    #[test]
    fn test_render_confirmed_dialog() {
        let xml = render_dialog_info("alice@example.com", 3, Some(&confirmed_call())).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(DIALOG_INFO_NS));
        assert!(xml.contains("<state>confirmed</state>"));
        assert!(xml.contains("local-tag=\"1928301774\""));
        assert!(!xml.contains("remote-tag"));
        assert_eq!(
            summarize(&xml),
            ("alice@example.com".to_string(), "3".to_string(), 1)
        );
    }

    #[test]
    fn test_render_rejected_as_terminated_with_event() {
        let mut info = confirmed_call();
        info.state = DialogCallState::Rejected;
        let xml = render_dialog_info("alice@example.com", 0, Some(&info)).unwrap();
        assert!(xml.contains("<state event=\"rejected\">terminated</state>"));
    }

    #[test]
    fn test_render_idle_resource() {
        let xml = render_dialog_info("bob@example.com", 0, None).unwrap();
        assert_eq!(summarize(&xml), ("bob@example.com".to_string(), "0".to_string(), 0));
    }

    #[test]
    fn test_attribute_values_are_escaped() {
        let mut info = confirmed_call();
        info.call_id = "x\"y&z".to_string();
        let xml = render_dialog_info("alice@example.com", 1, Some(&info)).unwrap();
        assert!(xml.contains("call-id=\"x&quot;y&amp;z\""));
    }
}
