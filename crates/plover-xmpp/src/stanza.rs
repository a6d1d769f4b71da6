use std::str::FromStr;

use jid::Jid;
use minidom::Element;

use crate::error::{DispatchError, ErrorCondition};

pub const NS_CLIENT: &str = "jabber:client";

/// Classification of a top-level stream element. SASL exchanges and
/// stream-management nonzas arrive as `Other`; they flow through the same
/// dispatch pipe so feature modules can claim them by criteria, but they are
/// never correlated as responses or answered with stanza errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    Other,
}

/// A top-level element received from or destined for the stream, with just
/// enough structure for routing. Typed payload parsing belongs to the feature
/// modules on either side of the dispatch boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Element,
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, DispatchError> {
        let xml = std::str::from_utf8(raw)
            .map_err(|error| DispatchError::ParseFailed(format!("invalid UTF-8: {error}")))?;
        let trimmed = xml.trim();
        if trimmed.is_empty() {
            return Err(DispatchError::ParseFailed("empty payload".to_string()));
        }

        let element = Element::from_str(trimmed)
            .map_err(|error| DispatchError::ParseFailed(format!("malformed XML: {error}")))?;
        Ok(Self::from_element(element))
    }

    pub fn from_element(element: Element) -> Self {
        let kind = match element.name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            _ => StanzaKind::Other,
        };
        Self { kind, element }
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.element.name()
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn set_id(&mut self, id: &str) {
        self.element.set_attr("id", id);
    }

    pub fn type_attr(&self) -> Option<&str> {
        self.element.attr("type")
    }

    pub fn from_attr(&self) -> Option<&str> {
        self.element.attr("from")
    }

    pub fn to_attr(&self) -> Option<&str> {
        self.element.attr("to")
    }

    pub fn from_jid(&self) -> Option<Jid> {
        self.from_attr().and_then(|raw| raw.parse().ok())
    }

    pub fn to_jid(&self) -> Option<Jid> {
        self.to_attr().and_then(|raw| raw.parse().ok())
    }

    /// An IQ of type `result` or `error`, i.e. a reply to something we sent.
    pub fn is_iq_response(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.type_attr(), Some("result") | Some("error"))
    }

    /// An IQ of type `get` or `set` (the default type for an IQ is `get`).
    pub fn is_iq_request(&self) -> bool {
        self.kind == StanzaKind::Iq
            && matches!(self.type_attr(), Some("get") | Some("set") | None)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DispatchError> {
        let mut payload = Vec::new();
        self.element.write_to(&mut payload).map_err(|error| {
            DispatchError::SerializeFailed(format!(
                "failed to serialize <{}/>: {error}",
                self.element.name()
            ))
        })?;
        Ok(payload)
    }

    /// Synthesize the error reply for an inbound IQ request: addressing
    /// swapped, `type='error'`, the condition appended. Returns `None` for
    /// anything that must not be answered with an error (IQ replies, non-IQ
    /// elements).
    pub fn error_reply(&self, condition: ErrorCondition) -> Option<Stanza> {
        if !self.is_iq_request() {
            return None;
        }

        let mut builder = Element::builder("iq", NS_CLIENT).attr("type", "error");
        if let Some(id) = self.id() {
            builder = builder.attr("id", id);
        }
        if let Some(from) = self.from_attr() {
            builder = builder.attr("to", from);
        }
        if let Some(to) = self.to_attr() {
            builder = builder.attr("from", to);
        }

        let element = builder.append(condition.to_error_element()).build();
        Some(Self::from_element(element))
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        stanza.element
    }
}
