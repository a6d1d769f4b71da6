use std::time::Duration;

use jid::{BareJid, Jid};
use tracing::warn;

use crate::error::ErrorCondition;
use crate::negotiation::SessionEvent;
use crate::response::{ResponseCallback, ResponseManager};
use crate::stanza::Stanza;
use crate::transport::ServerRecord;

/// Stable identifiers for the feature modules the sequencer knows how to
/// drive. External modules are free to register under any other id.
pub mod ids {
    pub const SASL_AUTH: &str = "sasl-auth";
    pub const RESOURCE_BIND: &str = "resource-bind";
    pub const SESSION_ESTABLISHMENT: &str = "session-establishment";
    pub const STREAM_MANAGEMENT: &str = "stream-management";
    pub const SERVICE_DISCOVERY: &str = "service-discovery";
    pub const PING: &str = "ping";
    pub const STREAM_FEATURES: &str = "stream-features";
}

/// Control entry points the session state machine invokes on feature modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleCommand {
    /// Start SASL negotiation (auth module).
    Login,
    /// Request resource binding (bind module).
    Bind,
    /// Run the legacy RFC 3921 session step (session module).
    EstablishSession,
    /// Attempt stream resumption with the saved token (SM module).
    Resume,
    /// Enable stream management on a freshly bound stream (SM module).
    Enable,
    /// Best-effort service discovery sweep after connect (disco module).
    Discover,
    /// Open the pipelined stream without waiting for auth completion
    /// (feature-stream module).
    StartStream,
    /// Request an ack and flush a final ack before `</stream>` (SM module).
    GracefulClose,
}

/// Result of an inbound filter hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// The stanza was absorbed; no further dispatch.
    Consumed,
    /// Continue down the chain.
    Pass,
}

/// Outbound work queued by modules during a dispatch or command call. The
/// session drains it after every call: stanzas run the outbound filter chain,
/// raw fragments (SASL payloads, nonzas) go straight to the transport.
#[derive(Default)]
pub struct Outbox {
    items: Vec<OutboundItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundItem {
    Stanza(Stanza),
    Fragment(Vec<u8>),
}

impl Outbox {
    pub fn push_stanza(&mut self, stanza: Stanza) {
        self.items.push(OutboundItem::Stanza(stanza));
    }

    pub fn push_fragment(&mut self, fragment: Vec<u8>) {
        self.items.push(OutboundItem::Fragment(fragment));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> Vec<OutboundItem> {
        std::mem::take(&mut self.items)
    }
}

/// Saved stream-management resumption state, set by the SM module once the
/// server confirms `<enabled resume='true'/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionToken {
    pub id: String,
    pub location: Option<ServerRecord>,
}

/// Session-scoped flags shared between the modules and the sequencer.
/// Modules write them through their context handle; the state machine reads
/// them when deciding the next negotiation step.
#[derive(Debug, Default, Clone)]
pub struct SessionFlags {
    /// The feature-stream module reports the server can pipeline, so the
    /// post-auth stream restart is deferred to `AuthFinishExpected`.
    pub pipelining_active: bool,
    /// Stream management is active on the current connection.
    pub sm_active: bool,
    /// Resumption credentials for the next reconnect, if the server granted
    /// them.
    pub resumption: Option<ResumptionToken>,
}

/// Non-owning handle modules receive during any call from the engine. Work
/// queued here is applied by the session after the call returns; nothing
/// re-enters the dispatcher.
pub struct ModuleContext<'a> {
    outbox: &'a mut Outbox,
    responses: &'a mut ResponseManager,
    flags: &'a mut SessionFlags,
    raised: &'a mut Vec<SessionEvent>,
    own_jid: &'a BareJid,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(
        outbox: &'a mut Outbox,
        responses: &'a mut ResponseManager,
        flags: &'a mut SessionFlags,
        raised: &'a mut Vec<SessionEvent>,
        own_jid: &'a BareJid,
    ) -> Self {
        Self {
            outbox,
            responses,
            flags,
            raised,
            own_jid,
        }
    }

    /// Feed a negotiation event to the session state machine. Delivered on
    /// the session's task queue after the current call completes.
    pub fn raise(&mut self, event: SessionEvent) {
        self.raised.push(event);
    }

    pub fn send(&mut self, stanza: Stanza) {
        self.outbox.push_stanza(stanza);
    }

    pub fn send_fragment(&mut self, fragment: impl Into<Vec<u8>>) {
        self.outbox.push_fragment(fragment.into());
    }

    /// Register a response callback for a request this module is sending.
    pub fn expect_reply(
        &mut self,
        id: &str,
        to: Option<&Jid>,
        timeout: Option<Duration>,
        callback: ResponseCallback,
    ) {
        self.responses.register(id, to, timeout, callback);
    }

    pub fn own_jid(&self) -> &BareJid {
        self.own_jid
    }

    pub fn flags(&mut self) -> &mut SessionFlags {
        self.flags
    }
}

/// The capability set a feature module exposes to the engine.
///
/// `process` and the filter hooks run on the session task queue; they may
/// queue outbound work through the context but must return promptly and must
/// not block.
pub trait Module: Send + 'static {
    fn id(&self) -> &'static str;

    /// Classifier deciding whether [`Module::process`] sees a stanza.
    fn criteria(&self, stanza: &Stanza) -> bool;

    fn process(
        &mut self,
        stanza: &Stanza,
        ctx: &mut ModuleContext<'_>,
    ) -> Result<(), ErrorCondition>;

    fn filter_incoming(
        &mut self,
        _stanza: &Stanza,
        _ctx: &mut ModuleContext<'_>,
    ) -> FilterOutcome {
        FilterOutcome::Pass
    }

    fn filter_outgoing(&mut self, _stanza: &mut Stanza, _ctx: &mut ModuleContext<'_>) {}

    /// Feature URIs this module advertises for service discovery.
    fn features(&self) -> &'static [&'static str] {
        &[]
    }

    /// Control entry for the negotiation sequencer. Modules ignore commands
    /// they do not implement.
    fn command(&mut self, _command: ModuleCommand, _ctx: &mut ModuleContext<'_>) {}

    fn stream_started(&mut self, _ctx: &mut ModuleContext<'_>) {}

    fn connection_restarted(&mut self) {}

    fn reset(&mut self) {}
}

/// Flat registry of feature modules, iterated in registration order for
/// filters and routing. Written during session setup, read-only afterwards.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, replacing any previous module with the same id
    /// while keeping its position in the dispatch order.
    pub fn register(&mut self, module: Box<dyn Module>) {
        let id = module.id();
        if let Some(slot) = self.modules.iter_mut().find(|m| m.id() == id) {
            warn!(module = id, "replacing previously registered module");
            *slot = module;
        } else {
            self.modules.push(module);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.iter().any(|module| module.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Box<dyn Module>> {
        self.modules.iter_mut().find(|module| module.id() == id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Module>> {
        self.modules.iter_mut()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.modules.iter().map(|module| module.id()).collect()
    }

    /// Union of every registered module's advertised feature URIs, in
    /// registration order.
    pub fn advertised_features(&self) -> Vec<&'static str> {
        self.modules
            .iter()
            .flat_map(|module| module.features().iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
