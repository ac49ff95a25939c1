//! Readiness multiplexer shared by both engines.
//!
//! One registration per connection: the reactor records the interest each
//! session wants and waits on the sessions' sockets directly through
//! `TcpStream::ready`, returning the addresses that became ready.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::{select_all, FutureExt};
use tokio::io::Interest;
use tracing::trace;

use crate::config::ServerAddr;
use crate::registry::SessionRegistry;

#[derive(Debug, Default)]
pub struct Reactor {
    interests: HashMap<ServerAddr, Interest>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a connection.
    pub fn register(&mut self, addr: ServerAddr, interest: Interest) {
        self.interests.insert(addr, interest);
    }

    pub fn deregister(&mut self, addr: &ServerAddr) {
        self.interests.remove(addr);
    }

    #[inline]
    pub fn is_registered(&self, addr: &ServerAddr) -> bool {
        self.interests.contains_key(addr)
    }

    pub fn interest(&self, addr: &ServerAddr) -> Option<Interest> {
        self.interests.get(addr).copied()
    }

    /// Refresh every registration from the sessions' own needs.
    ///
    /// Closed sessions are deregistered.
    pub fn update_interests(&mut self, sessions: &SessionRegistry) {
        self.interests.clear();
        for (addr, session) in sessions.iter() {
            if session.is_open() {
                self.interests.insert(addr.clone(), session.interest());
            }
        }
    }

    pub fn clear(&mut self) {
        self.interests.clear();
    }

    /// Wait up to `timeout` for any registered session to become ready.
    ///
    /// Returns every session ready at that point (empty on timeout).
    pub async fn select(&self, sessions: &SessionRegistry, timeout: Duration) -> Vec<ServerAddr> {
        let mut waits = Vec::new();
        for (addr, interest) in &self.interests {
            let Some(stream) = sessions.get(addr).and_then(|s| s.stream()) else {
                continue;
            };
            let interest = *interest;
            waits.push(
                async move {
                    // An error here resurfaces from the session's next read or write
                    let _ = stream.ready(interest).await;
                    addr.clone()
                }
                .boxed(),
            );
        }

        if waits.is_empty() {
            tokio::time::sleep(timeout).await;
            return Vec::new();
        }

        let (first, _, rest) = match tokio::time::timeout(timeout, select_all(waits)).await {
            Ok(selected) => selected,
            Err(_) => return Vec::new(),
        };
        let mut ready = vec![first];
        ready.extend(rest.into_iter().filter_map(|wait| wait.now_or_never()));
        trace!("Reactor selected {} session(s)", ready.len());
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, PacketType, DEFAULT_MAX_PAYLOAD_SIZE};
    use crate::session::Session;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn open_session(registry: &mut SessionRegistry) -> (ServerAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ServerAddr::new("127.0.0.1", listener.local_addr().unwrap().port());
        let mut session = Session::new(addr.clone(), 1024, DEFAULT_MAX_PAYLOAD_SIZE);
        let (open, accepted) = tokio::join!(session.open(Duration::from_secs(1)), listener.accept());
        open.unwrap();
        registry.add_server(session);
        (addr, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_select_times_out_when_idle() {
        let mut registry = SessionRegistry::new();
        let (addr, _server) = open_session(&mut registry).await;

        let mut reactor = Reactor::new();
        reactor.update_interests(&registry);
        assert_eq!(reactor.interest(&addr), Some(Interest::READABLE));

        let ready = reactor.select(&registry, Duration::from_millis(30)).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn test_select_returns_readable_session() {
        let mut registry = SessionRegistry::new();
        let (_quiet, _quiet_server) = open_session(&mut registry).await;
        let (busy, mut busy_server) = open_session(&mut registry).await;

        let mut reactor = Reactor::new();
        reactor.update_interests(&registry);

        busy_server
            .write_all(&Frame::response(PacketType::Noop, bytes::Bytes::new()).encode().unwrap())
            .await
            .unwrap();

        let ready = reactor.select(&registry, Duration::from_secs(2)).await;
        assert_eq!(ready, vec![busy]);
    }

    #[tokio::test]
    async fn test_write_interest_follows_queued_frames() {
        let mut registry = SessionRegistry::new();
        let (addr, _server) = open_session(&mut registry).await;
        registry
            .get_mut(&addr)
            .unwrap()
            .submit_frame(Frame::request(PacketType::CanDo, &b"f"[..]))
            .unwrap();

        let mut reactor = Reactor::new();
        reactor.update_interests(&registry);
        assert_eq!(
            reactor.interest(&addr),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        // A fresh socket is writable straight away
        let ready = reactor.select(&registry, Duration::from_secs(2)).await;
        assert_eq!(ready, vec![addr.clone()]);

        registry.get_mut(&addr).unwrap().close();
        reactor.update_interests(&registry);
        assert!(!reactor.is_registered(&addr));
    }
}
