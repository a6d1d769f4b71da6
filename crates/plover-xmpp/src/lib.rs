pub mod config;
pub mod dispatcher;
pub mod error;
pub mod features;
pub mod keepalive;
pub mod module;
pub mod negotiation;
pub mod response;
pub mod session;
pub mod stanza;
pub mod stream_error;
pub mod transport;

pub use config::SessionConfig;
pub use error::{ConnectionError, DispatchError, ErrorCondition};
pub use features::{StartTlsFeature, StreamFeatures};
pub use keepalive::{plan_keepalive, KeepalivePlan};
pub use module::{
    ids, FilterOutcome, Module, ModuleCommand, ModuleContext, ModuleRegistry, Outbox,
    ResumptionToken, SessionFlags,
};
pub use negotiation::{Action, CompressionMethod, NegotiationPhase, Negotiator, SessionEvent};
pub use response::{ResponseCallback, ResponseManager, ResponseOutcome};
pub use session::{Session, SessionCommand, TransportEvent};
pub use stanza::{Stanza, StanzaKind};
pub use stream_error::{SeeOtherHost, StreamError, StreamErrorCondition};
pub use transport::{ServerRecord, Transport};

pub use plover_core::event::{SessionState, SocketState};
