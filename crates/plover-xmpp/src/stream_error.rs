use minidom::Element;

/// RFC 6120 namespace for stream error conditions.
pub const NS_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    InvalidNamespace,
    NotAuthorized,
    PolicyViolation,
    RemoteConnectionFailed,
    Reset,
    ResourceConstraint,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
}

impl StreamErrorCondition {
    pub fn from_element_name(name: &str) -> Option<Self> {
        Some(match name {
            "bad-format" => StreamErrorCondition::BadFormat,
            "conflict" => StreamErrorCondition::Conflict,
            "connection-timeout" => StreamErrorCondition::ConnectionTimeout,
            "host-gone" => StreamErrorCondition::HostGone,
            "host-unknown" => StreamErrorCondition::HostUnknown,
            "invalid-namespace" => StreamErrorCondition::InvalidNamespace,
            "not-authorized" => StreamErrorCondition::NotAuthorized,
            "policy-violation" => StreamErrorCondition::PolicyViolation,
            "remote-connection-failed" => StreamErrorCondition::RemoteConnectionFailed,
            "reset" => StreamErrorCondition::Reset,
            "resource-constraint" => StreamErrorCondition::ResourceConstraint,
            "see-other-host" => StreamErrorCondition::SeeOtherHost,
            "system-shutdown" => StreamErrorCondition::SystemShutdown,
            "undefined-condition" => StreamErrorCondition::UndefinedCondition,
            _ => return None,
        })
    }

    pub fn element_name(&self) -> &'static str {
        match self {
            StreamErrorCondition::BadFormat => "bad-format",
            StreamErrorCondition::Conflict => "conflict",
            StreamErrorCondition::ConnectionTimeout => "connection-timeout",
            StreamErrorCondition::HostGone => "host-gone",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::InvalidNamespace => "invalid-namespace",
            StreamErrorCondition::NotAuthorized => "not-authorized",
            StreamErrorCondition::PolicyViolation => "policy-violation",
            StreamErrorCondition::RemoteConnectionFailed => "remote-connection-failed",
            StreamErrorCondition::Reset => "reset",
            StreamErrorCondition::ResourceConstraint => "resource-constraint",
            StreamErrorCondition::SeeOtherHost => "see-other-host",
            StreamErrorCondition::SystemShutdown => "system-shutdown",
            StreamErrorCondition::UndefinedCondition => "undefined-condition",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.element_name())
    }
}

/// Redirect target carried by a `see-other-host` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeeOtherHost {
    pub host: String,
    pub port: Option<u16>,
}

/// A parsed `<stream:error/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: Option<StreamErrorCondition>,
    pub text: Option<String>,
    pub see_other_host: Option<SeeOtherHost>,
}

impl StreamError {
    /// Parse the children of a stream error element. The element itself may
    /// arrive under the `stream` prefix namespace or unqualified depending on
    /// the framing layer, so only the children's namespace is authoritative.
    pub fn parse(element: &Element) -> Self {
        let mut condition = None;
        let mut text = None;
        let mut see_other_host = None;

        for child in element.children() {
            if child.ns() != NS_STREAMS {
                continue;
            }
            if child.name() == "text" {
                let value = child.text();
                if !value.is_empty() {
                    text = Some(value);
                }
                continue;
            }
            if let Some(parsed) = StreamErrorCondition::from_element_name(child.name()) {
                if parsed == StreamErrorCondition::SeeOtherHost {
                    see_other_host = parse_host_port(child.text().trim());
                }
                // first recognized condition wins
                condition.get_or_insert(parsed);
            }
        }

        Self {
            condition,
            text,
            see_other_host,
        }
    }
}

/// Split `HOST[:PORT]`, tolerating bracketed IPv6 literals (`[::1]:5223`).
/// A bare IPv6 literal without brackets is treated as a host with no port.
fn parse_host_port(raw: &str) -> Option<SeeOtherHost> {
    if raw.is_empty() {
        return None;
    }

    if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|port| port.parse::<u16>().ok());
        return Some(SeeOtherHost {
            host: host.to_string(),
            port,
        });
    }

    // more than one colon means an unbracketed IPv6 literal
    if raw.matches(':').count() > 1 {
        return Some(SeeOtherHost {
            host: raw.to_string(),
            port: None,
        });
    }

    match raw.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => Some(SeeOtherHost {
                host: host.to_string(),
                port: Some(port),
            }),
            Err(_) => Some(SeeOtherHost {
                host: raw.to_string(),
                port: None,
            }),
        },
        _ => Some(SeeOtherHost {
            host: raw.to_string(),
            port: None,
        }),
    }
}
