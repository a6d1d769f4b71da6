use std::future::Future;

use serde::{Deserialize, Serialize};

use plover_core::event::SocketState;

use crate::error::ConnectionError;

/// One connectable server endpoint, as produced by SRV resolution, a cached
/// `see-other-host` redirect, or a stream-management resumption location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub host: String,
    pub port: Option<u16>,
    pub priority: u16,
    pub weight: u16,
    pub direct_tls: bool,
}

impl ServerRecord {
    pub fn new(host: impl Into<String>, port: Option<u16>, direct_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            priority: 0,
            weight: 0,
            direct_tls,
        }
    }
}

/// Boundary to the byte-oriented connector. The engine never touches the
/// socket; it asks the transport to write fragments, upgrade the channel,
/// restart the stream after a negotiation step, or reconnect elsewhere.
///
/// Channel upgrades complete asynchronously on the transport's own task; the
/// transport reports completion back through the session's transport-event
/// entry points rather than through these return values.
pub trait Transport: Send + 'static {
    fn send(
        &mut self,
        fragment: &[u8],
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn restart_stream(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn start_tls(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn start_compression(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn reconnect(
        &mut self,
        target: Option<ServerRecord>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn socket_state(&self) -> SocketState;

    fn tls_active(&self) -> bool;

    fn compression_active(&self) -> bool;

    /// Endpoint of the current connection, when known. Consulted when caching
    /// a `see-other-host` redirect so the replacement inherits `direct_tls`.
    fn connection_details(&self) -> Option<ServerRecord>;
}
