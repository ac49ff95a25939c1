//! Engine-owned map of sessions keyed by server address.
//!
//! Neither engine shares this map: each keeps its registry behind its own
//! lock and only exposes server-level operations to callers. Iteration is
//! ordered by address so failover walks servers deterministically.

use std::collections::BTreeMap;

use crate::config::ServerAddr;
use crate::session::Session;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<ServerAddr, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` if one already exists for its address.
    pub fn add_server(&mut self, session: Session) -> bool {
        let addr = session.addr().clone();
        if self.sessions.contains_key(&addr) {
            return false;
        }
        self.sessions.insert(addr, session);
        true
    }

    /// Remove and return the session for `addr`.
    pub fn remove_server(&mut self, addr: &ServerAddr) -> Option<Session> {
        self.sessions.remove(addr)
    }

    #[inline]
    pub fn contains(&self, addr: &ServerAddr) -> bool {
        self.sessions.contains_key(addr)
    }

    pub fn get(&self, addr: &ServerAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    pub fn get_mut(&mut self, addr: &ServerAddr) -> Option<&mut Session> {
        self.sessions.get_mut(addr)
    }

    /// Visit every session in address order.
    pub fn for_each_session<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Session),
    {
        for session in self.sessions.values_mut() {
            f(session);
        }
    }

    /// All registered addresses, in order.
    pub fn servers(&self) -> Vec<ServerAddr> {
        self.sessions.keys().cloned().collect()
    }

    /// Addresses of sessions with an open connection, in order.
    pub fn open_servers(&self) -> Vec<ServerAddr> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.is_open())
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerAddr, &Session)> {
        self.sessions.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session and forget them.
    pub fn close_all(&mut self) {
        self.for_each_session(Session::close);
        self.sessions.clear();
    }
}
