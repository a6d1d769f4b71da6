use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-session options recognized by the engine. Everything here has a
/// conservative default; a client embedding the engine overrides what it
/// needs and passes the struct into [`crate::session::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Skip STARTTLS even when the server advertises it.
    pub disable_tls: bool,

    /// Skip zlib stream compression even when advertised.
    pub disable_compression: bool,

    /// Include `from` in the initial stream header so the server can redirect
    /// by bare JID before authentication.
    pub use_see_other_host: bool,

    /// Run the legacy RFC 3921 session step after bind. `None` means
    /// autodetect from the advertised `<session/>` feature.
    pub session_establishment_required: Option<bool>,

    /// Keepalive period.
    #[serde(with = "duration_seconds")]
    pub ping_interval: Duration,

    /// Default deadline for correlated IQ responses.
    #[serde(with = "duration_seconds")]
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disable_tls: false,
            disable_compression: false,
            use_see_other_host: true,
            session_establishment_required: None,
            ping_interval: Duration::from_secs(180),
            request_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
