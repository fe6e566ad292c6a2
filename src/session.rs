use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::CoreError;

/// Where a client session stands. The wire itself is stateless; this
/// is the server-side record that enforces request ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Authenticated,
    Profiled,
    ProbesSent,
    Probed,
    Served,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub nonce: String,
    pub phase: Phase,
    /// Probes issued this session and not yet answered.
    pub pending_probes: BTreeSet<String>,
}

impl Session {
    fn new() -> Self {
        Session {
            nonce: fresh_nonce(),
            phase: Phase::Authenticated,
            pending_probes: BTreeSet::new(),
        }
    }
}

fn fresh_nonce() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return "00000000".to_string();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// In-memory session records keyed by client name. A session that has
/// already been served restarts transparently on the next request.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    fn with_session<T>(&self, client: &str, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut inner = self.inner.lock().expect("session lock");
        let session = inner
            .entry(client.to_string())
            .or_insert_with(Session::new);
        if session.phase == Phase::Served {
            *session = Session::new();
        }
        f(session)
    }

    pub fn profiled(&self, client: &str) {
        self.with_session(client, |session| {
            session.phase = Phase::Profiled;
        });
    }

    /// Record the probes just issued; the session may not fetch its
    /// configuration until every one of them is answered.
    pub fn probes_sent(&self, client: &str, names: impl IntoIterator<Item = String>) {
        self.with_session(client, |session| {
            session.pending_probes = names.into_iter().collect();
            session.phase = Phase::ProbesSent;
        });
    }

    pub fn probes_received(&self, client: &str) {
        self.with_session(client, |session| {
            session.pending_probes.clear();
            session.phase = Phase::Probed;
        });
    }

    pub fn ensure_ready_for_config(&self, client: &str) -> Result<(), CoreError> {
        self.with_session(client, |session| {
            if session.phase == Phase::ProbesSent && !session.pending_probes.is_empty() {
                return Err(CoreError::ProbeOrder(format!(
                    "client {client} has {} unanswered probes",
                    session.pending_probes.len()
                )));
            }
            Ok(())
        })
    }

    pub fn served(&self, client: &str) {
        let mut inner = self.inner.lock().expect("session lock");
        if let Some(session) = inner.get_mut(client) {
            session.phase = Phase::Served;
        }
    }

    pub fn reset(&self, client: &str) {
        self.inner.lock().expect("session lock").remove(client);
    }

    pub fn phase(&self, client: &str) -> Option<Phase> {
        self.inner
            .lock()
            .expect("session lock")
            .get(client)
            .map(|s| s.phase)
    }
}
