use jid::Jid;
use tracing::{debug, warn};

use plover_core::event::{EventPayload, SessionState, SocketState};

use crate::config::SessionConfig;
use crate::features::StreamFeatures;
use crate::module::{ids, ModuleCommand, SessionFlags};
use crate::transport::ServerRecord;

/// Inputs the session state machine consumes. Feature modules raise these
/// through their context handle; the session's public entry points feed in
/// the transport-originated ones.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TransportStateChanged(SocketState),
    TlsEstablished,
    CompressionEnabled,
    StreamFeaturesReceived(StreamFeatures),
    AuthSuccess,
    AuthFailed { condition: Option<String> },
    AuthFinishExpected,
    ResourceBound { jid: Jid },
    BindFailed { condition: Option<String> },
    SessionEstablished,
    SessionError { condition: Option<String> },
    SmResumed,
    SmFailed,
}

/// Side effects the machine asks the session to carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SendFragment(Vec<u8>),
    RestartStream,
    StartTls,
    StartCompression(CompressionMethod),
    InvokeModule(&'static str, ModuleCommand),
    /// Lifecycle notification for a module after a server-directed restart.
    NotifyRestart(&'static str),
    CacheRedirect(ServerRecord),
    Reconnect,
    PublishState(SessionState),
    Emit(EventPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Zlib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationPhase {
    #[default]
    AwaitingFeatures,
    StartTlsInProgress,
    CompressionInProgress,
    AuthInProgress,
    BindInProgress,
    SessionInProgress,
    SmEnableInProgress,
    Ready,
    Failed,
}

/// Drives RFC 6120 negotiation ordering: TLS, then compression, then SASL,
/// then bind / session establishment / stream management. Holds no I/O; every
/// decision comes back as an [`Action`] list for the session to apply.
pub struct Negotiator {
    config: SessionConfig,
    phase: NegotiationPhase,
    socket: SocketState,
    tls_active: bool,
    compression_active: bool,
    authenticated: bool,
    bound: Option<Jid>,
    previous_bound: Option<Jid>,
    resumed: bool,
    sm_advertised: bool,
    session_required: bool,
}

impl Negotiator {
    pub fn new(config: SessionConfig) -> Self {
        let session_required = config.session_establishment_required.unwrap_or(false);
        Self {
            config,
            phase: NegotiationPhase::AwaitingFeatures,
            socket: SocketState::Disconnected,
            tls_active: false,
            compression_active: false,
            authenticated: false,
            bound: None,
            previous_bound: None,
            resumed: false,
            sm_advertised: false,
            session_required,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Sync channel security with what the transport already negotiated
    /// (direct-TLS connections start with TLS active).
    pub fn sync_channel(&mut self, tls_active: bool, compression_active: bool) {
        self.tls_active = tls_active;
        self.compression_active = compression_active;
    }

    pub fn on_event(&mut self, event: SessionEvent, flags: &SessionFlags) -> Vec<Action> {
        match event {
            SessionEvent::TransportStateChanged(state) => self.on_socket(state),
            SessionEvent::TlsEstablished => {
                self.tls_active = true;
                self.phase = NegotiationPhase::AwaitingFeatures;
                vec![Action::RestartStream]
            }
            SessionEvent::CompressionEnabled => {
                self.compression_active = true;
                self.phase = NegotiationPhase::AwaitingFeatures;
                vec![Action::RestartStream]
            }
            SessionEvent::StreamFeaturesReceived(features) => self.on_features(features, flags),
            SessionEvent::AuthSuccess => self.on_auth_success(flags),
            SessionEvent::AuthFinishExpected => self.on_auth_finish_expected(flags),
            SessionEvent::AuthFailed { condition } => {
                warn!(?condition, "authentication failed");
                self.phase = NegotiationPhase::Failed;
                Vec::new()
            }
            SessionEvent::ResourceBound { jid } => self.on_bound(jid, flags),
            SessionEvent::BindFailed { condition } => {
                warn!(?condition, "resource binding failed");
                self.phase = NegotiationPhase::Failed;
                Vec::new()
            }
            SessionEvent::SessionEstablished => self.on_established(flags),
            SessionEvent::SessionError { condition } => {
                warn!(?condition, "session establishment failed");
                self.phase = NegotiationPhase::Failed;
                Vec::new()
            }
            SessionEvent::SmResumed => self.on_resumed(),
            SessionEvent::SmFailed => {
                debug!("stream resumption failed, falling back to a fresh bind");
                self.resumed = false;
                self.phase = NegotiationPhase::BindInProgress;
                vec![Action::InvokeModule(ids::RESOURCE_BIND, ModuleCommand::Bind)]
            }
        }
    }

    fn on_socket(&mut self, state: SocketState) -> Vec<Action> {
        self.socket = state;
        match state {
            SocketState::Connecting => {
                self.reset_connection();
                vec![Action::PublishState(SessionState::Connecting)]
            }
            SocketState::Connected => {
                self.phase = NegotiationPhase::AwaitingFeatures;
                Vec::new()
            }
            SocketState::Disconnected => {
                self.phase = NegotiationPhase::Failed;
                vec![Action::PublishState(SessionState::Disconnected)]
            }
        }
    }

    fn on_features(&mut self, features: StreamFeatures, flags: &SessionFlags) -> Vec<Action> {
        match self.phase {
            NegotiationPhase::AwaitingFeatures | NegotiationPhase::AuthInProgress => {}
            NegotiationPhase::Ready => {
                debug!("ignoring spurious stream features after negotiation finished");
                return Vec::new();
            }
            other => {
                warn!(phase = ?other, "ignoring stream features in unexpected phase");
                return Vec::new();
            }
        }

        self.sm_advertised = features.stream_management;
        self.session_required = self
            .config
            .session_establishment_required
            .unwrap_or_else(|| features.session_required());

        if !self.tls_active && !self.config.disable_tls && features.starttls.is_some() {
            self.phase = NegotiationPhase::StartTlsInProgress;
            return vec![Action::StartTls];
        }

        if !self.compression_active
            && !self.config.disable_compression
            && features.supports_zlib()
        {
            self.phase = NegotiationPhase::CompressionInProgress;
            return vec![Action::StartCompression(CompressionMethod::Zlib)];
        }

        if !self.authenticated {
            if self.phase == NegotiationPhase::AuthInProgress {
                // pipelined stream: auth is still in flight, keep going
                self.authenticated = true;
                return self.advance_after_auth(flags);
            }
            self.phase = NegotiationPhase::AuthInProgress;
            return vec![Action::InvokeModule(ids::SASL_AUTH, ModuleCommand::Login)];
        }

        self.advance_after_auth(flags)
    }

    fn advance_after_auth(&mut self, flags: &SessionFlags) -> Vec<Action> {
        if self.sm_advertised && !self.resumed && flags.resumption.is_some() {
            self.phase = NegotiationPhase::SmEnableInProgress;
            vec![Action::InvokeModule(
                ids::STREAM_MANAGEMENT,
                ModuleCommand::Resume,
            )]
        } else {
            self.phase = NegotiationPhase::BindInProgress;
            vec![Action::InvokeModule(ids::RESOURCE_BIND, ModuleCommand::Bind)]
        }
    }

    fn on_auth_success(&mut self, flags: &SessionFlags) -> Vec<Action> {
        self.authenticated = true;
        if flags.pipelining_active {
            // the restart was already pipelined on AuthFinishExpected
            debug!("authentication confirmed on pipelined stream");
            return Vec::new();
        }
        self.phase = NegotiationPhase::AwaitingFeatures;
        vec![Action::RestartStream]
    }

    fn on_auth_finish_expected(&mut self, flags: &SessionFlags) -> Vec<Action> {
        if !flags.pipelining_active {
            warn!("ignoring AuthFinishExpected without active pipelining");
            return Vec::new();
        }
        // equivalent to auth success while pipelining
        self.authenticated = true;
        self.phase = NegotiationPhase::AwaitingFeatures;
        vec![Action::InvokeModule(
            ids::STREAM_FEATURES,
            ModuleCommand::StartStream,
        )]
    }

    fn on_bound(&mut self, jid: Jid, flags: &SessionFlags) -> Vec<Action> {
        debug!(%jid, "resource bound");
        self.bound = Some(jid);

        if self.session_required {
            self.phase = NegotiationPhase::SessionInProgress;
            return vec![Action::InvokeModule(
                ids::SESSION_ESTABLISHMENT,
                ModuleCommand::EstablishSession,
            )];
        }

        let mut actions = vec![Action::Emit(EventPayload::SessionEstablishmentSuccess)];
        actions.extend(self.on_established(flags));
        actions
    }

    fn on_established(&mut self, _flags: &SessionFlags) -> Vec<Action> {
        self.phase = NegotiationPhase::Ready;
        let mut actions = vec![
            Action::PublishState(SessionState::Connected),
            Action::InvokeModule(ids::SERVICE_DISCOVERY, ModuleCommand::Discover),
        ];
        if self.sm_advertised && !self.resumed {
            actions.push(Action::InvokeModule(
                ids::STREAM_MANAGEMENT,
                ModuleCommand::Enable,
            ));
        }
        actions
    }

    fn on_resumed(&mut self) -> Vec<Action> {
        self.resumed = true;
        self.authenticated = true;
        // the resource bound on the resumed stream survives
        if self.bound.is_none() {
            self.bound = self.previous_bound.take();
        }
        self.phase = NegotiationPhase::Ready;
        vec![
            Action::PublishState(SessionState::Connected),
            Action::InvokeModule(ids::SERVICE_DISCOVERY, ModuleCommand::Discover),
        ]
    }

    /// Clear everything scoped to one physical connection. Resumption
    /// credentials live in [`SessionFlags`], owned by the session, so a
    /// reconnect can still resume.
    pub fn reset_connection(&mut self) {
        self.phase = NegotiationPhase::AwaitingFeatures;
        self.tls_active = false;
        self.compression_active = false;
        self.authenticated = false;
        if let Some(bound) = self.bound.take() {
            self.previous_bound = Some(bound);
        }
        self.resumed = false;
        self.sm_advertised = false;
        self.session_required = self.config.session_establishment_required.unwrap_or(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{StartTlsFeature, StreamFeatures};
    use crate::module::ResumptionToken;

    fn negotiator() -> Negotiator {
        Negotiator::new(SessionConfig::default())
    }

    fn flags() -> SessionFlags {
        SessionFlags::default()
    }

    fn features_with_tls() -> StreamFeatures {
        StreamFeatures {
            starttls: Some(StartTlsFeature { required: true }),
            ..StreamFeatures::default()
        }
    }

    fn features_with_sasl() -> StreamFeatures {
        StreamFeatures {
            sasl_mechanisms: vec!["PLAIN".to_string()],
            ..StreamFeatures::default()
        }
    }

    fn features_with_bind() -> StreamFeatures {
        StreamFeatures {
            bind: true,
            ..StreamFeatures::default()
        }
    }

    #[test]
    fn starttls_runs_before_anything_else() {
        let mut machine = negotiator();
        let actions = machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_tls()),
            &flags(),
        );
        assert_eq!(actions, vec![Action::StartTls]);
        assert_eq!(machine.phase(), NegotiationPhase::StartTlsInProgress);

        let actions = machine.on_event(SessionEvent::TlsEstablished, &flags());
        assert_eq!(actions, vec![Action::RestartStream]);
        assert_eq!(machine.phase(), NegotiationPhase::AwaitingFeatures);
    }

    #[test]
    fn disable_tls_skips_advertised_starttls() {
        let config = SessionConfig {
            disable_tls: true,
            ..SessionConfig::default()
        };
        let mut machine = Negotiator::new(config);
        let mut offered = features_with_tls();
        offered.sasl_mechanisms = vec!["PLAIN".to_string()];

        let actions = machine.on_event(SessionEvent::StreamFeaturesReceived(offered), &flags());
        assert_eq!(
            actions,
            vec![Action::InvokeModule(ids::SASL_AUTH, ModuleCommand::Login)]
        );
    }

    #[test]
    fn zlib_compression_runs_after_tls_and_restarts_stream() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);

        let offered = StreamFeatures {
            compression_methods: vec!["zlib".to_string()],
            ..StreamFeatures::default()
        };
        let actions = machine.on_event(SessionEvent::StreamFeaturesReceived(offered), &flags());
        assert_eq!(
            actions,
            vec![Action::StartCompression(CompressionMethod::Zlib)]
        );

        let actions = machine.on_event(SessionEvent::CompressionEnabled, &flags());
        assert_eq!(actions, vec![Action::RestartStream]);
    }

    #[test]
    fn auth_success_restarts_stream_without_pipelining() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);
        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &flags(),
        );
        assert_eq!(machine.phase(), NegotiationPhase::AuthInProgress);

        let actions = machine.on_event(SessionEvent::AuthSuccess, &flags());
        assert_eq!(actions, vec![Action::RestartStream]);
        assert!(machine.is_authenticated());
    }

    #[test]
    fn pipelining_defers_restart_to_auth_finish_expected() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);
        let mut active = flags();
        active.pipelining_active = true;

        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &active,
        );
        let actions = machine.on_event(SessionEvent::AuthFinishExpected, &active);
        assert_eq!(
            actions,
            vec![Action::InvokeModule(
                ids::STREAM_FEATURES,
                ModuleCommand::StartStream
            )]
        );
        assert!(machine.is_authenticated());

        // the eventual success does not restart a second time
        let actions = machine.on_event(SessionEvent::AuthSuccess, &active);
        assert_eq!(actions, Vec::new());
    }

    #[test]
    fn auth_finish_expected_is_ignored_without_pipelining() {
        let mut machine = negotiator();
        let actions = machine.on_event(SessionEvent::AuthFinishExpected, &flags());
        assert!(actions.is_empty());
        assert!(!machine.is_authenticated());
    }

    #[test]
    fn post_auth_features_invoke_bind_without_resumption() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);
        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &flags(),
        );
        machine.on_event(SessionEvent::AuthSuccess, &flags());

        let actions = machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_bind()),
            &flags(),
        );
        assert_eq!(
            actions,
            vec![Action::InvokeModule(ids::RESOURCE_BIND, ModuleCommand::Bind)]
        );
    }

    #[test]
    fn resumption_token_prefers_resume_over_bind() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);
        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &flags(),
        );
        machine.on_event(SessionEvent::AuthSuccess, &flags());

        let mut resumable = flags();
        resumable.resumption = Some(ResumptionToken {
            id: "rsid-7".to_string(),
            location: None,
        });
        let offered = StreamFeatures {
            bind: true,
            stream_management: true,
            ..StreamFeatures::default()
        };

        let actions = machine.on_event(SessionEvent::StreamFeaturesReceived(offered), &resumable);
        assert_eq!(
            actions,
            vec![Action::InvokeModule(
                ids::STREAM_MANAGEMENT,
                ModuleCommand::Resume
            )]
        );
        assert_eq!(machine.phase(), NegotiationPhase::SmEnableInProgress);
    }

    #[test]
    fn resume_success_connects_without_rebinding() {
        let mut machine = negotiator();
        let actions = machine.on_event(SessionEvent::SmResumed, &flags());
        assert_eq!(
            actions,
            vec![
                Action::PublishState(SessionState::Connected),
                Action::InvokeModule(ids::SERVICE_DISCOVERY, ModuleCommand::Discover),
            ]
        );
        assert_eq!(machine.phase(), NegotiationPhase::Ready);
        assert!(machine.resumed());
    }

    #[test]
    fn resume_failure_falls_back_to_bind() {
        let mut machine = negotiator();
        let actions = machine.on_event(SessionEvent::SmFailed, &flags());
        assert_eq!(
            actions,
            vec![Action::InvokeModule(ids::RESOURCE_BIND, ModuleCommand::Bind)]
        );
        assert_eq!(machine.phase(), NegotiationPhase::BindInProgress);
    }

    #[test]
    fn bind_without_session_step_connects_and_enables_sm() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);
        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &flags(),
        );
        machine.on_event(SessionEvent::AuthSuccess, &flags());
        let offered = StreamFeatures {
            bind: true,
            stream_management: true,
            ..StreamFeatures::default()
        };
        machine.on_event(SessionEvent::StreamFeaturesReceived(offered), &flags());

        let jid: Jid = "alice@example.com/mobile".parse().expect("JID should parse");
        let actions = machine.on_event(SessionEvent::ResourceBound { jid: jid.clone() }, &flags());
        assert_eq!(
            actions,
            vec![
                Action::Emit(EventPayload::SessionEstablishmentSuccess),
                Action::PublishState(SessionState::Connected),
                Action::InvokeModule(ids::SERVICE_DISCOVERY, ModuleCommand::Discover),
                Action::InvokeModule(ids::STREAM_MANAGEMENT, ModuleCommand::Enable),
            ]
        );
        assert_eq!(machine.bound_jid(), Some(&jid));
        assert_eq!(machine.phase(), NegotiationPhase::Ready);
    }

    #[test]
    fn required_session_feature_runs_establishment_before_connected() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);
        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &flags(),
        );
        machine.on_event(SessionEvent::AuthSuccess, &flags());
        let offered = StreamFeatures {
            bind: true,
            session: Some(crate::features::SessionFeature { optional: false }),
            ..StreamFeatures::default()
        };
        machine.on_event(SessionEvent::StreamFeaturesReceived(offered), &flags());

        let jid: Jid = "alice@example.com/mobile".parse().expect("JID should parse");
        let actions = machine.on_event(SessionEvent::ResourceBound { jid }, &flags());
        assert_eq!(
            actions,
            vec![Action::InvokeModule(
                ids::SESSION_ESTABLISHMENT,
                ModuleCommand::EstablishSession
            )]
        );
        assert_eq!(machine.phase(), NegotiationPhase::SessionInProgress);

        let actions = machine.on_event(SessionEvent::SessionEstablished, &flags());
        assert_eq!(actions[0], Action::PublishState(SessionState::Connected));
    }

    #[test]
    fn features_after_ready_are_ignored() {
        let mut machine = negotiator();
        machine.on_event(SessionEvent::SmResumed, &flags());
        assert_eq!(machine.phase(), NegotiationPhase::Ready);

        let actions = machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_bind()),
            &flags(),
        );
        assert!(actions.is_empty());
        assert_eq!(machine.phase(), NegotiationPhase::Ready);
    }

    #[test]
    fn auth_failure_parks_the_machine() {
        let mut machine = negotiator();
        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &flags(),
        );
        let actions = machine.on_event(
            SessionEvent::AuthFailed {
                condition: Some("not-authorized".to_string()),
            },
            &flags(),
        );
        assert!(actions.is_empty());
        assert_eq!(machine.phase(), NegotiationPhase::Failed);
    }

    #[test]
    fn socket_connecting_resets_per_connection_state() {
        let mut machine = negotiator();
        machine.sync_channel(true, true);
        machine.on_event(SessionEvent::AuthSuccess, &flags());
        assert!(machine.is_authenticated());

        let actions = machine.on_event(
            SessionEvent::TransportStateChanged(SocketState::Connecting),
            &flags(),
        );
        assert_eq!(
            actions,
            vec![Action::PublishState(SessionState::Connecting)]
        );
        assert!(!machine.is_authenticated());
        assert_eq!(machine.phase(), NegotiationPhase::AwaitingFeatures);
    }

    #[test]
    fn socket_disconnect_publishes_disconnected() {
        let mut machine = negotiator();
        let actions = machine.on_event(
            SessionEvent::TransportStateChanged(SocketState::Disconnected),
            &flags(),
        );
        assert_eq!(
            actions,
            vec![Action::PublishState(SessionState::Disconnected)]
        );
        assert_eq!(machine.phase(), NegotiationPhase::Failed);
    }

    #[test]
    fn pipelined_features_during_auth_proceed_to_bind() {
        let mut machine = negotiator();
        machine.sync_channel(true, false);
        let mut active = flags();
        active.pipelining_active = true;

        machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_sasl()),
            &active,
        );
        assert_eq!(machine.phase(), NegotiationPhase::AuthInProgress);

        // the pipelined stream's features arrive before AuthSuccess
        let actions = machine.on_event(
            SessionEvent::StreamFeaturesReceived(features_with_bind()),
            &active,
        );
        assert_eq!(
            actions,
            vec![Action::InvokeModule(ids::RESOURCE_BIND, ModuleCommand::Bind)]
        );
        assert!(machine.is_authenticated());
    }
}
