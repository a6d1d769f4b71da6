use jid::BareJid;
use minidom::Element;
use uuid::Uuid;

use crate::module::{ids, ModuleRegistry};
use crate::stanza::{Stanza, NS_CLIENT};

pub const NS_PING: &str = "urn:xmpp:ping";

/// What a keepalive tick should put on the wire.
#[derive(Debug)]
pub enum KeepalivePlan {
    /// XEP-0199 ping to the account's own bare JID, correlated by id so a
    /// missing reply can be observed.
    Ping { stanza: Stanza, id: String },
    /// No ping module registered: fall back to the transport's whitespace
    /// keepalive.
    Whitespace,
}

pub fn plan_keepalive(registry: &ModuleRegistry, own_jid: &BareJid) -> KeepalivePlan {
    if !registry.contains(ids::PING) {
        return KeepalivePlan::Whitespace;
    }

    let id = Uuid::new_v4().to_string();
    let element = Element::builder("iq", NS_CLIENT)
        .attr("type", "get")
        .attr("id", id.as_str())
        .attr("to", own_jid.to_string())
        .append(Element::builder("ping", NS_PING).build())
        .build();

    KeepalivePlan::Ping {
        stanza: Stanza::from_element(element),
        id,
    }
}
