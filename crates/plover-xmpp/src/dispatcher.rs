use std::panic::{catch_unwind, AssertUnwindSafe};

use jid::BareJid;
use tracing::{debug, warn};

use crate::error::{DispatchError, ErrorCondition};
use crate::module::{FilterOutcome, ModuleContext, ModuleRegistry, Outbox, SessionFlags};
use crate::negotiation::SessionEvent;
use crate::response::{ResponseManager, ResponseOutcome};
use crate::stanza::Stanza;

/// Route one inbound element. Consumers are tried strictly in this order and
/// a stanza reaches at most one of them: an inbound filter, the response
/// table, the matching modules, or the feature-not-implemented fallback.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_inbound(
    stanza: Stanza,
    registry: &mut ModuleRegistry,
    responses: &mut ResponseManager,
    outbox: &mut Outbox,
    flags: &mut SessionFlags,
    raised: &mut Vec<SessionEvent>,
    own_jid: &BareJid,
) {
    for module in registry.iter_mut() {
        let mut ctx = ModuleContext::new(
            &mut *outbox,
            &mut *responses,
            &mut *flags,
            &mut *raised,
            own_jid,
        );
        if module.filter_incoming(&stanza, &mut ctx) == FilterOutcome::Consumed {
            debug!(
                module = module.id(),
                stanza = stanza.name(),
                "inbound stanza consumed by filter"
            );
            return;
        }
    }

    if stanza.is_iq_response() {
        if let Some(id) = stanza.id() {
            let id = id.to_string();
            let from = stanza.from_jid();
            if let Some(callback) = responses.take(&id, from.as_ref()) {
                debug!(%id, "correlated IQ response delivered");
                callback(ResponseOutcome::Reply(stanza));
                return;
            }
        }
        debug!("dropping stale IQ response");
        return;
    }

    let mut matched = false;
    let mut reply_sent = false;
    for module in registry.iter_mut() {
        if !module.criteria(&stanza) {
            continue;
        }
        matched = true;

        let mut ctx = ModuleContext::new(
            &mut *outbox,
            &mut *responses,
            &mut *flags,
            &mut *raised,
            own_jid,
        );
        let condition = match catch_unwind(AssertUnwindSafe(|| {
            module.process(&stanza, &mut ctx)
        })) {
            Ok(Ok(())) => None,
            Ok(Err(condition)) => {
                warn!(
                    module = module.id(),
                    %condition,
                    "module rejected inbound stanza"
                );
                Some(condition)
            }
            Err(_) => {
                warn!(
                    module = module.id(),
                    stanza = stanza.name(),
                    "module panicked while processing stanza"
                );
                Some(ErrorCondition::UndefinedCondition)
            }
        };

        if let (Some(condition), false) = (condition, reply_sent) {
            if let Some(reply) = stanza.error_reply(condition) {
                outbox.push_stanza(reply);
                reply_sent = true;
            }
        }
    }

    if matched {
        return;
    }

    if stanza.is_iq_request() {
        debug!(
            id = stanza.id(),
            "no module handles inbound IQ, replying feature-not-implemented"
        );
        if let Some(reply) = stanza.error_reply(ErrorCondition::FeatureNotImplemented) {
            outbox.push_stanza(reply);
        }
    } else {
        debug!(stanza = stanza.name(), "no module matched inbound stanza");
    }
}

/// Run the outbound filter chain to completion and serialize. Filters may
/// rewrite the stanza; they must not block or re-enter the dispatcher.
pub fn run_outbound(
    mut stanza: Stanza,
    registry: &mut ModuleRegistry,
    responses: &mut ResponseManager,
    outbox: &mut Outbox,
    flags: &mut SessionFlags,
    raised: &mut Vec<SessionEvent>,
    own_jid: &BareJid,
) -> Result<Vec<u8>, DispatchError> {
    for module in registry.iter_mut() {
        let mut ctx = ModuleContext::new(
            &mut *outbox,
            &mut *responses,
            &mut *flags,
            &mut *raised,
            own_jid,
        );
        module.filter_outgoing(&mut stanza, &mut ctx);
    }
    stanza.to_bytes()
}
