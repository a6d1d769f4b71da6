use minidom::Element;

pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_SM_3: &str = "urn:xmpp:sm:3";
pub const NS_SM_2: &str = "urn:xmpp:sm:2";

pub const COMPRESSION_ZLIB: &str = "zlib";

/// What the server offered in its last `<stream:features/>`. Parsed once per
/// stream (re)start and handed to the negotiation sequencer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: Option<StartTlsFeature>,
    pub compression_methods: Vec<String>,
    pub sasl_mechanisms: Vec<String>,
    pub bind: bool,
    pub session: Option<SessionFeature>,
    pub stream_management: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTlsFeature {
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFeature {
    /// RFC 6121 servers advertise `<optional/>` inside `<session/>` when the
    /// legacy establishment step may be skipped.
    pub optional: bool,
}

impl StreamFeatures {
    pub fn parse(element: &Element) -> Self {
        let starttls = element
            .get_child("starttls", NS_TLS)
            .map(|child| StartTlsFeature {
                required: child.has_child("required", NS_TLS),
            });

        let compression_methods = element
            .get_child("compression", NS_COMPRESS_FEATURE)
            .map(|compression| {
                compression
                    .children()
                    .filter(|child| child.name() == "method")
                    .map(|method| method.text())
                    .collect()
            })
            .unwrap_or_default();

        let sasl_mechanisms = element
            .get_child("mechanisms", NS_SASL)
            .map(|mechanisms| {
                mechanisms
                    .children()
                    .filter(|child| child.name() == "mechanism")
                    .map(|mechanism| mechanism.text())
                    .collect()
            })
            .unwrap_or_default();

        let session = element
            .get_child("session", NS_SESSION)
            .map(|child| SessionFeature {
                optional: child.has_child("optional", NS_SESSION),
            });

        Self {
            starttls,
            compression_methods,
            sasl_mechanisms,
            bind: element.has_child("bind", NS_BIND),
            session,
            stream_management: element.has_child("sm", NS_SM_3)
                || element.has_child("sm", NS_SM_2),
        }
    }

    pub fn supports_zlib(&self) -> bool {
        self.compression_methods
            .iter()
            .any(|method| method == COMPRESSION_ZLIB)
    }

    /// Whether the server requires the legacy session step after bind.
    pub fn session_required(&self) -> bool {
        matches!(self.session, Some(SessionFeature { optional: false }))
    }
}
