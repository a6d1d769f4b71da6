use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Domains an event channel may belong to, in fixed order. Each domain is
/// backed by its own broadcast channel so a subscriber to `stream.**` never
/// pays for unrelated traffic.
const DOMAINS: [&str; 4] = ["session", "stream", "module", "transport"];

/// Hierarchical channel name, e.g. `session.state.changed`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        domain_index(name.split('.').next().unwrap_or_default()).is_some()
    }

    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn domain_index(domain: &str) -> Option<usize> {
    DOMAINS.iter().position(|d| *d == domain)
}

/// Observable state of a logical session. Distinct from [`SocketState`]: the
/// session is `Connected` only after resource binding (or stream resumption)
/// completes, which can be long after the socket connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// State of the underlying transport socket as reported by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SocketState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// The envelope wrapping every event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    Session,
    Transport,
    Module(String),
}

/// Everything the session engine publishes during negotiation and routing.
/// Feature modules subscribe to the variants they care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    StreamFeaturesReceived {
        features: String,
    },
    AuthSuccess,
    AuthFailed {
        condition: Option<String>,
    },
    AuthFinishExpected,
    ResourceBindSuccess {
        jid: String,
    },
    ResourceBindError {
        condition: Option<String>,
    },
    SessionEstablishmentSuccess,
    SessionEstablishmentError {
        condition: Option<String>,
    },
    SmResumed,
    SmFailed,
    SessionCleared,
    SessionStateChanged {
        state: SessionState,
    },
    TransportStateChanged {
        state: SocketState,
    },
    ErrorEvent {
        condition: Option<String>,
        text: Option<String>,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Fan-out bus over one tokio broadcast channel per domain.
#[derive(Clone)]
pub struct BroadcastEventBus {
    senders: [broadcast::Sender<Event>; 4],
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        Self {
            senders: std::array::from_fn(|_| broadcast::channel(capacity).0),
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> Result<[Option<broadcast::Receiver<Event>>; 4], EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();
        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(std::array::from_fn(|i| Some(self.senders[i].subscribe())));
        }

        let index = domain_index(first_segment)
            .ok_or_else(|| EventBusError::InvalidPattern(pattern.to_string()))?;
        Ok(std::array::from_fn(|i| {
            (i == index).then(|| self.senders[i].subscribe())
        }))
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let index = domain_index(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // send fails only when there is no subscriber, which is fine
        let _ = self.senders[index].send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: [Option<broadcast::Receiver<Event>>; 4],
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let [session, stream, module, transport] = &mut self.receivers;

            let received = tokio::select! {
                result = recv_from_domain(session.as_mut()) => result,
                result = recv_from_domain(stream.as_mut()) => result,
                result = recv_from_domain(module.as_mut()) => result,
                result = recv_from_domain(transport.as_mut()) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '!'))
}
