use minidom::Element;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    TransportError(String),

    #[error("TLS negotiation failed: {0}")]
    TlsFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("session terminated")]
    SessionTerminated,

    #[error("request timed out")]
    Timeout,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::AuthenticationFailed(_))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),
}

/// RFC 6120 namespace for stanza error conditions.
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Stanza-level error conditions the engine recognizes, with the RFC 6120
/// error-type each one is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    ItemNotFound,
    NotAuthorized,
    RemoteServerTimeout,
    ServiceUnavailable,
    UndefinedCondition,
}

impl ErrorCondition {
    pub fn element_name(&self) -> &'static str {
        match self {
            ErrorCondition::BadRequest => "bad-request",
            ErrorCondition::Conflict => "conflict",
            ErrorCondition::FeatureNotImplemented => "feature-not-implemented",
            ErrorCondition::Forbidden => "forbidden",
            ErrorCondition::ItemNotFound => "item-not-found",
            ErrorCondition::NotAuthorized => "not-authorized",
            ErrorCondition::RemoteServerTimeout => "remote-server-timeout",
            ErrorCondition::ServiceUnavailable => "service-unavailable",
            ErrorCondition::UndefinedCondition => "undefined-condition",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ErrorCondition::BadRequest => "modify",
            ErrorCondition::Conflict => "cancel",
            ErrorCondition::FeatureNotImplemented => "cancel",
            ErrorCondition::Forbidden => "auth",
            ErrorCondition::ItemNotFound => "cancel",
            ErrorCondition::NotAuthorized => "auth",
            ErrorCondition::RemoteServerTimeout => "wait",
            ErrorCondition::ServiceUnavailable => "cancel",
            ErrorCondition::UndefinedCondition => "cancel",
        }
    }

    pub fn from_element_name(name: &str) -> Option<Self> {
        Some(match name {
            "bad-request" => ErrorCondition::BadRequest,
            "conflict" => ErrorCondition::Conflict,
            "feature-not-implemented" => ErrorCondition::FeatureNotImplemented,
            "forbidden" => ErrorCondition::Forbidden,
            "item-not-found" => ErrorCondition::ItemNotFound,
            "not-authorized" => ErrorCondition::NotAuthorized,
            "remote-server-timeout" => ErrorCondition::RemoteServerTimeout,
            "service-unavailable" => ErrorCondition::ServiceUnavailable,
            "undefined-condition" => ErrorCondition::UndefinedCondition,
            _ => return None,
        })
    }

    /// Build the `<error/>` element carrying this condition.
    pub fn to_error_element(&self) -> Element {
        Element::builder("error", crate::stanza::NS_CLIENT)
            .attr("type", self.error_type())
            .append(Element::builder(self.element_name(), NS_STANZAS).build())
            .build()
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.element_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_is_non_retryable() {
        assert!(!ConnectionError::AuthenticationFailed("bad password".to_string()).is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(ConnectionError::TransportError("reset".to_string()).is_retryable());
    }

    #[test]
    fn condition_names_round_trip() {
        for condition in [
            ErrorCondition::BadRequest,
            ErrorCondition::Conflict,
            ErrorCondition::FeatureNotImplemented,
            ErrorCondition::Forbidden,
            ErrorCondition::ItemNotFound,
            ErrorCondition::NotAuthorized,
            ErrorCondition::RemoteServerTimeout,
            ErrorCondition::ServiceUnavailable,
            ErrorCondition::UndefinedCondition,
        ] {
            assert_eq!(
                ErrorCondition::from_element_name(condition.element_name()),
                Some(condition)
            );
        }
        assert_eq!(ErrorCondition::from_element_name("gone"), None);
    }

    #[test]
    fn error_element_carries_type_and_condition() {
        let element = ErrorCondition::FeatureNotImplemented.to_error_element();
        assert_eq!(element.name(), "error");
        assert_eq!(element.attr("type"), Some("cancel"));
        assert!(element.has_child("feature-not-implemented", NS_STANZAS));
    }
}
