use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use plover_core::event::{
    Channel, Event, EventBus, EventPayload, EventSource, SessionState, SocketState,
};

use crate::config::SessionConfig;
use crate::dispatcher::{dispatch_inbound, run_outbound};
use crate::error::ConnectionError;
use crate::features::{StreamFeatures, NS_STREAM};
use crate::keepalive::{plan_keepalive, KeepalivePlan};
use crate::module::{
    ids, Module, ModuleCommand, ModuleContext, ModuleRegistry, OutboundItem, Outbox, SessionFlags,
};
use crate::negotiation::{Action, CompressionMethod, Negotiator, SessionEvent};
use crate::response::{ResponseCallback, ResponseManager, ResponseOutcome};
use crate::stanza::Stanza;
use crate::stream_error::StreamError;
use crate::transport::{ServerRecord, Transport};

/// Channel-upgrade and socket notifications delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(SocketState),
    TlsEstablished,
    CompressionEnabled,
}

/// Messages accepted by the [`Session::run`] actor loop.
pub enum SessionCommand {
    Send(Stanza),
    Request {
        stanza: Stanza,
        timeout: Option<Duration>,
        callback: ResponseCallback,
    },
    StartStream,
    Received(Element),
    StreamError(Element),
    StreamTerminated,
    Transport(TransportEvent),
    Close {
        done: Box<dyn FnOnce() + Send>,
    },
    Shutdown,
}

/// One logical account connection: the negotiation sequencer, the dispatch
/// pipeline, the response table, and the module registry, glued to a
/// transport.
///
/// All mutation happens through `&mut self`; drive the session from a single
/// task (the [`Session::run`] loop, or direct calls in the same order the
/// transport delivers frames) and inbound dispatch stays strictly ordered.
pub struct Session<T: Transport> {
    own_jid: BareJid,
    config: SessionConfig,
    transport: T,
    bus: Arc<dyn EventBus>,
    registry: ModuleRegistry,
    responses: ResponseManager,
    negotiator: Negotiator,
    flags: SessionFlags,
    outbox: Outbox,
    raised: Vec<SessionEvent>,
    redirect: Option<ServerRecord>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    setup_done: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(
        own_jid: BareJid,
        config: SessionConfig,
        transport: T,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let responses = ResponseManager::new(own_jid.clone(), config.request_timeout);
        let negotiator = Negotiator::new(config.clone());
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        Self {
            own_jid,
            config,
            transport,
            bus,
            registry: ModuleRegistry::new(),
            responses,
            negotiator,
            flags: SessionFlags::default(),
            outbox: Outbox::default(),
            raised: Vec::new(),
            redirect: None,
            state_tx,
            state_rx,
            setup_done: false,
        }
    }

    /// Register a feature module. The registry is sealed once [`Session::bind`]
    /// runs; later registrations are ignored.
    pub fn register_module(&mut self, module: Box<dyn Module>) {
        if self.setup_done {
            warn!(module = module.id(), "registry is sealed after bind");
            return;
        }
        self.registry.register(module);
    }

    /// Finish setup. Idempotent: a second `bind` (or a bind after `unbind`)
    /// leaves the registry exactly as the first one did.
    pub fn bind(&mut self) {
        if self.setup_done {
            return;
        }
        debug!(modules = ?self.registry.ids(), "session bound");
        self.setup_done = true;
    }

    /// Tear the session down: fail every pending response, reset modules and
    /// per-connection state, and announce the cleared session.
    pub fn unbind(&mut self) {
        self.responses.fail_all();
        for module in self.registry.iter_mut() {
            module.reset();
        }
        self.flags = SessionFlags::default();
        self.redirect = None;
        self.raised.clear();
        self.outbox.drain();
        self.negotiator.reset_connection();
        self.set_state(SessionState::Disconnected);
        self.publish_payload(EventPayload::SessionCleared);
        self.setup_done = false;
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Observe session-state changes without holding the session.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn bound_jid(&self) -> Option<&Jid> {
        self.negotiator.bound_jid()
    }

    pub fn own_jid(&self) -> &BareJid {
        &self.own_jid
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open (or reopen) the XML stream: emit the header and give every module
    /// its `stream_started` notification.
    pub async fn start_stream(&mut self) -> Result<(), ConnectionError> {
        let header = self.stream_header();
        self.transport.send(&header).await?;

        let Self {
            registry,
            responses,
            outbox,
            flags,
            raised,
            own_jid,
            ..
        } = self;
        for module in registry.iter_mut() {
            let mut ctx =
                ModuleContext::new(&mut *outbox, &mut *responses, &mut *flags, &mut *raised, own_jid);
            module.stream_started(&mut ctx);
        }

        self.pump().await
    }

    /// Entry point for every parsed top-level element from the transport.
    pub async fn received_incoming(&mut self, element: Element) -> Result<(), ConnectionError> {
        if element.is("features", NS_STREAM) {
            let features = StreamFeatures::parse(&element);
            self.publish_payload(EventPayload::StreamFeaturesReceived {
                features: element_to_string(&element),
            });
            self.raised
                .push(SessionEvent::StreamFeaturesReceived(features));
            return self.pump().await;
        }

        if element.is("error", NS_STREAM) {
            return self.on_stream_error(&element).await;
        }

        let stanza = Stanza::from_element(element);
        let Self {
            registry,
            responses,
            outbox,
            flags,
            raised,
            own_jid,
            ..
        } = self;
        dispatch_inbound(stanza, registry, responses, outbox, flags, raised, own_jid);

        self.pump().await
    }

    /// Push one stanza through the outbound filter chain and onto the wire.
    pub async fn sending_outgoing(&mut self, stanza: Stanza) -> Result<(), ConnectionError> {
        self.outbox.push_stanza(stanza);
        self.pump().await
    }

    /// Send a request stanza and correlate its reply. A missing id is filled
    /// in; the callback fires exactly once with the reply, a timeout, or
    /// session termination.
    pub async fn send_request(
        &mut self,
        mut stanza: Stanza,
        timeout: Option<Duration>,
        callback: ResponseCallback,
    ) -> Result<(), ConnectionError> {
        if stanza.id().is_none() {
            stanza.set_id(&Uuid::new_v4().to_string());
        }
        let id = stanza
            .id()
            .map(str::to_string)
            .unwrap_or_default();
        let to = stanza.to_jid();
        self.responses.register(&id, to.as_ref(), timeout, callback);
        self.sending_outgoing(stanza).await
    }

    /// Keepalive tick: an application-level ping when a ping module is
    /// registered, otherwise the transport's whitespace keepalive.
    pub async fn keepalive(&mut self) -> Result<(), ConnectionError> {
        match plan_keepalive(&self.registry, &self.own_jid) {
            KeepalivePlan::Ping { stanza, id } => {
                self.responses.register(
                    &id,
                    None,
                    None,
                    Box::new(|outcome| {
                        if matches!(outcome, ResponseOutcome::Timeout) {
                            warn!("keepalive ping went unanswered, possible broken connection");
                        }
                    }),
                );
                self.sending_outgoing(stanza).await
            }
            KeepalivePlan::Whitespace => self.transport.send(b" ").await,
        }
    }

    /// Transport-originated notifications (socket state, channel upgrades).
    pub async fn transport_event(&mut self, event: TransportEvent) -> Result<(), ConnectionError> {
        match event {
            TransportEvent::StateChanged(state) => {
                if state == SocketState::Connected {
                    self.negotiator.sync_channel(
                        self.transport.tls_active(),
                        self.transport.compression_active(),
                    );
                }
                self.raised.push(SessionEvent::TransportStateChanged(state));
            }
            TransportEvent::TlsEstablished => self.raised.push(SessionEvent::TlsEstablished),
            TransportEvent::CompressionEnabled => {
                self.raised.push(SessionEvent::CompressionEnabled);
            }
        }
        self.pump().await
    }

    /// Handle a `<stream:error/>`. A `see-other-host` with known connection
    /// details caches the redirect and asks the transport to reconnect;
    /// everything else is surfaced as an error event for the transport layer
    /// to act on.
    pub async fn on_stream_error(&mut self, element: &Element) -> Result<(), ConnectionError> {
        let parsed = StreamError::parse(element);

        if let Some(target) = &parsed.see_other_host {
            if let Some(current) = self.transport.connection_details() {
                let record =
                    ServerRecord::new(target.host.clone(), target.port, current.direct_tls);
                debug!(host = %record.host, port = ?record.port, "caching see-other-host redirect");
                let actions = vec![
                    Action::CacheRedirect(record),
                    Action::NotifyRestart(ids::STREAM_FEATURES),
                    Action::Reconnect,
                ];
                self.apply_actions(actions).await?;
                return self.pump().await;
            }
            debug!("see-other-host without current connection details, treating as plain error");
        }

        self.publish_payload(EventPayload::ErrorEvent {
            condition: parsed
                .condition
                .map(|condition| condition.element_name().to_string()),
            text: parsed.text.clone(),
        });
        self.pump().await
    }

    /// The stream ended. Stream-management state survives only when the
    /// transport is already reconnecting; any other termination clears it.
    pub async fn on_stream_terminate(&mut self) -> Result<(), ConnectionError> {
        if self.transport.socket_state() == SocketState::Connecting {
            debug!("stream terminated during reconnect, keeping resumption state");
            self.negotiator.reset_connection();
            return self.pump().await;
        }

        self.flags.resumption = None;
        self.flags.sm_active = false;
        if let Some(module) = self.registry.get_mut(ids::STREAM_MANAGEMENT) {
            module.reset();
        }
        self.negotiator.reset_connection();
        self.set_state(SessionState::Disconnected);
        self.pump().await
    }

    /// Orderly close: when stream management is active, ask for a final ack
    /// exchange so the server can persist its queue, then run `done` after
    /// any in-flight dispatch has drained.
    pub async fn on_stream_close(
        &mut self,
        done: impl FnOnce(),
    ) -> Result<(), ConnectionError> {
        self.set_state(SessionState::Disconnecting);
        if self.flags.sm_active {
            self.invoke_module(ids::STREAM_MANAGEMENT, ModuleCommand::GracefulClose);
            self.pump().await?;
        }
        done();
        Ok(())
    }

    /// Where the transport should connect next, in priority order: a cached
    /// `see-other-host` redirect (consumed by this call), the saved
    /// stream-management resumption location, or nothing (SRV resolution).
    pub fn server_to_connect_details(&mut self) -> Option<ServerRecord> {
        if let Some(record) = self.redirect.take() {
            debug!(host = %record.host, "consuming cached redirect");
            return Some(record);
        }
        self.flags
            .resumption
            .as_ref()
            .and_then(|token| token.location.clone())
    }

    /// Actor loop: serialize commands, the response reaper, and keepalives
    /// onto this session's task.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        const REAPER_PERIOD: Duration = Duration::from_secs(1);

        let start = tokio::time::Instant::now();
        let mut reaper =
            tokio::time::interval_at(start + REAPER_PERIOD, REAPER_PERIOD);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ping =
            tokio::time::interval_at(start + self.config.ping_interval, self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => {
                        self.unbind();
                        return;
                    }
                    Some(command) => {
                        if let Err(error) = self.handle_command(command).await {
                            warn!(%error, "session command failed");
                        }
                    }
                },
                _ = reaper.tick() => self.expire_pending(),
                _ = ping.tick() => {
                    if self.state() == SessionState::Connected {
                        if let Err(error) = self.keepalive().await {
                            warn!(%error, "keepalive failed");
                        }
                    }
                }
            }
        }
    }

    /// Reaper tick: time out expired pending responses.
    pub fn expire_pending(&mut self) {
        self.responses.expire(tokio::time::Instant::now());
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), ConnectionError> {
        match command {
            SessionCommand::Send(stanza) => self.sending_outgoing(stanza).await,
            SessionCommand::Request {
                stanza,
                timeout,
                callback,
            } => self.send_request(stanza, timeout, callback).await,
            SessionCommand::StartStream => self.start_stream().await,
            SessionCommand::Received(element) => self.received_incoming(element).await,
            SessionCommand::StreamError(element) => self.on_stream_error(&element).await,
            SessionCommand::StreamTerminated => self.on_stream_terminate().await,
            SessionCommand::Transport(event) => self.transport_event(event).await,
            SessionCommand::Close { done } => self.on_stream_close(done).await,
            SessionCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Drain raised negotiation events and queued outbound work until both
    /// are empty. Events run before sends so a module's queued reply always
    /// reflects the machine's latest decisions.
    async fn pump(&mut self) -> Result<(), ConnectionError> {
        loop {
            if !self.raised.is_empty() {
                let event = self.raised.remove(0);
                self.mirror_event(&event);
                let actions = self.negotiator.on_event(event, &self.flags);
                self.apply_actions(actions).await?;
                continue;
            }
            if !self.outbox.is_empty() {
                self.flush_outbox().await?;
                continue;
            }
            return Ok(());
        }
    }

    async fn apply_actions(&mut self, actions: Vec<Action>) -> Result<(), ConnectionError> {
        for action in actions {
            match action {
                Action::SendFragment(bytes) => self.transport.send(&bytes).await?,
                Action::RestartStream => self.transport.restart_stream().await?,
                Action::StartTls => self.transport.start_tls().await?,
                Action::StartCompression(CompressionMethod::Zlib) => {
                    self.transport.start_compression().await?;
                }
                Action::InvokeModule(id, command) => self.invoke_module(id, command),
                Action::NotifyRestart(id) => {
                    if let Some(module) = self.registry.get_mut(id) {
                        module.connection_restarted();
                    }
                }
                Action::CacheRedirect(record) => self.redirect = Some(record),
                Action::Reconnect => self.transport.reconnect(None).await?,
                Action::PublishState(state) => self.set_state(state),
                Action::Emit(payload) => self.publish_payload(payload),
            }
        }
        Ok(())
    }

    fn invoke_module(&mut self, id: &'static str, command: ModuleCommand) {
        let Self {
            registry,
            responses,
            outbox,
            flags,
            raised,
            own_jid,
            ..
        } = self;
        match registry.get_mut(id) {
            Some(module) => {
                let mut ctx = ModuleContext::new(
                    &mut *outbox,
                    &mut *responses,
                    &mut *flags,
                    &mut *raised,
                    own_jid,
                );
                module.command(command, &mut ctx);
            }
            None => warn!(module = id, ?command, "command for unregistered module dropped"),
        }
    }

    async fn flush_outbox(&mut self) -> Result<(), ConnectionError> {
        for item in self.outbox.drain() {
            match item {
                OutboundItem::Stanza(stanza) => {
                    let serialized = {
                        let Self {
                            registry,
                            responses,
                            outbox,
                            flags,
                            raised,
                            own_jid,
                            ..
                        } = &mut *self;
                        run_outbound(stanza, registry, responses, outbox, flags, raised, own_jid)
                    };
                    match serialized {
                        Ok(bytes) => self.transport.send(&bytes).await?,
                        Err(error) => warn!(%error, "dropping unserializable outbound stanza"),
                    }
                }
                OutboundItem::Fragment(bytes) => self.transport.send(&bytes).await?,
            }
        }
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        if *self.state_rx.borrow() == state {
            return;
        }
        debug!(?state, "session state changed");
        self.state_tx.send_replace(state);
        if state == SessionState::Disconnected {
            self.responses.fail_all();
        }
        self.publish_payload(EventPayload::SessionStateChanged { state });
    }

    fn mirror_event(&self, event: &SessionEvent) {
        let payload = match event {
            SessionEvent::TransportStateChanged(state) => {
                EventPayload::TransportStateChanged { state: *state }
            }
            SessionEvent::TlsEstablished
            | SessionEvent::CompressionEnabled
            | SessionEvent::StreamFeaturesReceived(_) => return,
            SessionEvent::AuthSuccess => EventPayload::AuthSuccess,
            SessionEvent::AuthFailed { condition } => EventPayload::AuthFailed {
                condition: condition.clone(),
            },
            SessionEvent::AuthFinishExpected => EventPayload::AuthFinishExpected,
            SessionEvent::ResourceBound { jid } => EventPayload::ResourceBindSuccess {
                jid: jid.to_string(),
            },
            SessionEvent::BindFailed { condition } => EventPayload::ResourceBindError {
                condition: condition.clone(),
            },
            SessionEvent::SessionEstablished => EventPayload::SessionEstablishmentSuccess,
            SessionEvent::SessionError { condition } => EventPayload::SessionEstablishmentError {
                condition: condition.clone(),
            },
            SessionEvent::SmResumed => EventPayload::SmResumed,
            SessionEvent::SmFailed => EventPayload::SmFailed,
        };
        self.publish_payload(payload);
    }

    fn publish_payload(&self, payload: EventPayload) {
        let name = channel_for(&payload);
        let Ok(channel) = Channel::new(name) else {
            warn!(channel = name, "refusing to publish on invalid channel");
            return;
        };
        let _ = self
            .bus
            .publish(Event::new(channel, EventSource::Session, payload));
    }

    fn stream_header(&self) -> Vec<u8> {
        let domain = self.own_jid.domain();
        let mut header = format!("<stream:stream to='{domain}'");
        if self.config.use_see_other_host && self.own_jid.node().is_some() {
            header.push_str(&format!(" from='{}'", self.own_jid));
        }
        header.push_str(
            " version='1.0' xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams'>",
        );
        header.into_bytes()
    }
}

fn channel_for(payload: &EventPayload) -> &'static str {
    match payload {
        EventPayload::StreamFeaturesReceived { .. } => "stream.features.received",
        EventPayload::AuthSuccess => "session.auth.success",
        EventPayload::AuthFailed { .. } => "session.auth.failed",
        EventPayload::AuthFinishExpected => "session.auth.finish",
        EventPayload::ResourceBindSuccess { .. } => "session.bind.success",
        EventPayload::ResourceBindError { .. } => "session.bind.error",
        EventPayload::SessionEstablishmentSuccess => "session.establishment.success",
        EventPayload::SessionEstablishmentError { .. } => "session.establishment.error",
        EventPayload::SmResumed => "stream.sm.resumed",
        EventPayload::SmFailed => "stream.sm.failed",
        EventPayload::SessionCleared => "session.cleared",
        EventPayload::SessionStateChanged { .. } => "session.state.changed",
        EventPayload::TransportStateChanged { .. } => "transport.socket.changed",
        EventPayload::ErrorEvent { .. } => "stream.error.received",
    }
}

fn element_to_string(element: &Element) -> String {
    let mut buffer = Vec::new();
    if element.write_to(&mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plover_core::event::BroadcastEventBus;

    #[derive(Default)]
    struct NullTransport {
        sent: Vec<Vec<u8>>,
    }

    impl Transport for NullTransport {
        async fn send(&mut self, fragment: &[u8]) -> Result<(), ConnectionError> {
            self.sent.push(fragment.to_vec());
            Ok(())
        }

        async fn restart_stream(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn start_tls(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn start_compression(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn reconnect(&mut self, _target: Option<ServerRecord>) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn socket_state(&self) -> SocketState {
            SocketState::Disconnected
        }

        fn tls_active(&self) -> bool {
            false
        }

        fn compression_active(&self) -> bool {
            false
        }

        fn connection_details(&self) -> Option<ServerRecord> {
            None
        }
    }

    fn session() -> Session<NullTransport> {
        Session::new(
            "alice@example.com".parse().expect("own JID should parse"),
            SessionConfig::default(),
            NullTransport::default(),
            Arc::new(BroadcastEventBus::new(16)),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_header_includes_from_for_redirectable_accounts() {
        let mut session = session();
        session.start_stream().await.expect("start_stream should succeed");

        let header =
            String::from_utf8(session.transport.sent[0].clone()).expect("header should be UTF-8");
        assert!(header.starts_with("<stream:stream to='example.com'"));
        assert!(header.contains("from='alice@example.com'"));
        assert!(header.contains("version='1.0'"));
        assert!(header.contains("xmlns='jabber:client'"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_header_omits_from_when_redirect_disabled() {
        let mut session = Session::new(
            "alice@example.com".parse().expect("own JID should parse"),
            SessionConfig {
                use_see_other_host: false,
                ..SessionConfig::default()
            },
            NullTransport::default(),
            Arc::new(BroadcastEventBus::new(16)),
        );
        session.start_stream().await.expect("start_stream should succeed");

        let header =
            String::from_utf8(session.transport.sent[0].clone()).expect("header should be UTF-8");
        assert!(!header.contains("from="));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bind_is_idempotent_and_seals_the_registry() {
        struct Inert;
        impl Module for Inert {
            fn id(&self) -> &'static str {
                "inert"
            }
            fn criteria(&self, _stanza: &Stanza) -> bool {
                false
            }
            fn process(
                &mut self,
                _stanza: &Stanza,
                _ctx: &mut ModuleContext<'_>,
            ) -> Result<(), crate::error::ErrorCondition> {
                Ok(())
            }
        }
        struct Late;
        impl Module for Late {
            fn id(&self) -> &'static str {
                "late"
            }
            fn criteria(&self, _stanza: &Stanza) -> bool {
                false
            }
            fn process(
                &mut self,
                _stanza: &Stanza,
                _ctx: &mut ModuleContext<'_>,
            ) -> Result<(), crate::error::ErrorCondition> {
                Ok(())
            }
        }

        let mut session = session();
        session.register_module(Box::new(Inert));
        session.bind();
        session.bind();
        session.register_module(Box::new(Late));
        assert_eq!(session.registry.ids(), vec!["inert"]);

        session.unbind();
        session.bind();
        assert_eq!(session.registry.ids(), vec!["inert"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unbind_fails_pendings_and_announces_cleared_session() {
        let bus = Arc::new(BroadcastEventBus::new(16));
        let mut cleared = bus
            .subscribe("session.cleared")
            .expect("subscription should succeed");

        let mut session = Session::new(
            "alice@example.com".parse().expect("own JID should parse"),
            SessionConfig::default(),
            NullTransport::default(),
            bus.clone(),
        );

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        {
            let fired = fired.clone();
            let stanza = Stanza::parse(
                b"<iq xmlns='jabber:client' type='get' id='q1' to='svc.example.com'/>",
            )
            .expect("stanza should parse");
            session
                .send_request(
                    stanza,
                    None,
                    Box::new(move |outcome| {
                        assert!(matches!(outcome, ResponseOutcome::SessionTerminated));
                        fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }),
                )
                .await
                .expect("request should send");
        }

        session.unbind();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(session.responses.is_empty());

        let event = cleared.recv().await.expect("cleared event should arrive");
        assert!(matches!(event.payload, EventPayload::SessionCleared));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn request_without_id_gets_one_assigned() {
        let mut session = session();
        let stanza = Stanza::parse(b"<iq xmlns='jabber:client' type='get' to='svc.example.com'/>")
            .expect("stanza should parse");
        session
            .send_request(stanza, None, Box::new(|_| {}))
            .await
            .expect("request should send");

        assert_eq!(session.responses.len(), 1);
        let sent = String::from_utf8(session.transport.sent[0].clone())
            .expect("stanza should be UTF-8");
        assert!(sent.contains("id="));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn whitespace_keepalive_without_ping_module() {
        let mut session = session();
        session.keepalive().await.expect("keepalive should succeed");
        assert_eq!(session.transport.sent, vec![b" ".to_vec()]);
        assert!(session.responses.is_empty());
    }
}
