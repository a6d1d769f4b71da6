use std::collections::HashMap;
use std::time::Duration;

use jid::{BareJid, Jid};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::stanza::Stanza;

/// What a pending request ultimately resolved to.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// The matching `result` or `error` IQ.
    Reply(Stanza),
    /// No reply arrived before the deadline.
    Timeout,
    /// The session was torn down with the request still outstanding.
    SessionTerminated,
}

pub type ResponseCallback = Box<dyn FnOnce(ResponseOutcome) + Send>;

struct PendingEntry {
    callback: ResponseCallback,
    deadline: Instant,
}

/// Correlates outbound IQ requests with their replies by `(id, remote)`.
///
/// The remote key is the request's `to` address, or the account's own bare
/// JID when the request was addressed to the server (`to` absent). A reply
/// from a full JID also matches an entry keyed to its bare form, since
/// servers may answer from a specific resource.
pub struct ResponseManager {
    own_jid: BareJid,
    default_timeout: Duration,
    pending: HashMap<(String, String), PendingEntry>,
}

impl ResponseManager {
    pub fn new(own_jid: BareJid, default_timeout: Duration) -> Self {
        Self {
            own_jid,
            default_timeout,
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Track an outbound request. `timeout` of `None` uses the configured
    /// default deadline.
    pub fn register(
        &mut self,
        id: &str,
        to: Option<&Jid>,
        timeout: Option<Duration>,
        callback: ResponseCallback,
    ) {
        let remote = self.remote_key(to);
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let key = (id.to_string(), remote);
        if self
            .pending
            .insert(
                key,
                PendingEntry { callback, deadline },
            )
            .is_some()
        {
            warn!(id, "replaced pending response entry with duplicate key");
        }
    }

    /// Remove and return the callback matching an inbound reply. After a
    /// successful take the same entry can never match again.
    pub fn take(&mut self, id: &str, from: Option<&Jid>) -> Option<ResponseCallback> {
        let primary = self.remote_key(from);
        if let Some(entry) = self.pending.remove(&(id.to_string(), primary)) {
            return Some(entry.callback);
        }

        // a reply from a full JID satisfies a request sent to the bare JID
        if let Some(from) = from {
            if from.resource().is_some() {
                let bare = from.to_bare().to_string();
                if let Some(entry) = self.pending.remove(&(id.to_string(), bare)) {
                    return Some(entry.callback);
                }
            }
        }

        None
    }

    /// Reaper tick: invoke every expired callback with a timeout outcome.
    pub fn expire(&mut self, now: Instant) {
        let expired: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(entry) = self.pending.remove(&key) {
                debug!(id = %key.0, remote = %key.1, "pending response expired");
                (entry.callback)(ResponseOutcome::Timeout);
            }
        }
    }

    /// Session teardown: fail everything still outstanding.
    pub fn fail_all(&mut self) {
        for (key, entry) in self.pending.drain() {
            debug!(id = %key.0, remote = %key.1, "failing pending response on teardown");
            (entry.callback)(ResponseOutcome::SessionTerminated);
        }
    }

    fn remote_key(&self, jid: Option<&Jid>) -> String {
        jid.map(|jid| jid.to_string())
            .unwrap_or_else(|| self.own_jid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };

    use super::*;

    fn manager() -> ResponseManager {
        let own: BareJid = "alice@example.com".parse().expect("own JID should parse");
        ResponseManager::new(own, Duration::from_secs(30))
    }

    fn jid(raw: &str) -> Jid {
        raw.parse().expect("JID should parse")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn take_matches_id_and_remote_exactly_once() {
        let mut manager = manager();
        manager.register("q1", Some(&jid("svc.example.com")), None, Box::new(|_| {}));

        assert!(manager.take("q1", Some(&jid("other.example.com"))).is_none());
        assert!(manager.take("q2", Some(&jid("svc.example.com"))).is_none());
        assert!(manager.take("q1", Some(&jid("svc.example.com"))).is_some());
        assert!(
            manager.take("q1", Some(&jid("svc.example.com"))).is_none(),
            "an entry must never match twice"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reply_from_full_jid_matches_bare_entry() {
        let mut manager = manager();
        manager.register("q1", Some(&jid("bob@example.com")), None, Box::new(|_| {}));

        assert!(manager
            .take("q1", Some(&jid("bob@example.com/mobile")))
            .is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn absent_addresses_normalize_to_own_bare_jid() {
        let mut manager = manager();
        manager.register("ping-1", None, None, Box::new(|_| {}));

        assert!(manager.take("ping-1", None).is_some());

        manager.register("ping-2", None, None, Box::new(|_| {}));
        assert!(manager
            .take("ping-2", Some(&jid("alice@example.com")))
            .is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn expiry_fires_timeout_exactly_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut manager = manager();
        {
            let fired = fired.clone();
            manager.register(
                "q1",
                Some(&jid("svc.example.com")),
                Some(Duration::from_secs(1)),
                Box::new(move |outcome| {
                    assert!(matches!(outcome, ResponseOutcome::Timeout));
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        tokio::time::advance(Duration::from_millis(200)).await;
        manager.expire(Instant::now());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(manager.len(), 1);

        tokio::time::advance(Duration::from_millis(900)).await;
        manager.expire(Instant::now());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());

        // a late reply after expiry no longer matches
        assert!(manager.take("q1", Some(&jid("svc.example.com"))).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn teardown_fails_every_pending_entry() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut manager = manager();
        for id in ["a", "b", "c"] {
            let outcomes = outcomes.clone();
            manager.register(
                id,
                Some(&jid("svc.example.com")),
                None,
                Box::new(move |outcome| {
                    outcomes
                        .lock()
                        .expect("outcome log should lock")
                        .push(matches!(outcome, ResponseOutcome::SessionTerminated));
                }),
            );
        }

        manager.fail_all();
        assert!(manager.is_empty());
        let outcomes = outcomes.lock().expect("outcome log should lock");
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|terminated| *terminated));
    }
}
