//! One TCP connection to one job server.
//!
//! A session owns the outbound write queue, the queue of tasks waiting for
//! their request to hit the wire, and the FIFO queue of tasks waiting for
//! the server's acknowledgement. Responses carry no correlation id: a
//! response is matched against the task at the head of the acknowledgement
//! queue, so that queue must mirror the order in which requests were
//! written.
//!
//! I/O is non-blocking. [`Session::drive_io`] writes what it can, reads what
//! is available and queues [`SessionEvent`]s for the owning engine; it
//! never waits for readiness itself (see [`crate::reactor::Reactor`]).

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::config::ServerAddr;
use crate::error::{GearwireError, Result};
use crate::protocol::{Frame, FrameBuffer, PacketType};
use crate::task::{Task, TaskState};

/// Something the owning engine needs to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A response frame. Correlated responses have already been fed to the
    /// task they acknowledge; uncorrelated ones (work updates, errors) only
    /// reach the engine through this event.
    Response(Frame),
    /// A correlated response arrived but the head of the acknowledgement
    /// queue was not a request it can answer. The session stays usable.
    Mismatch {
        response: PacketType,
        pending: Option<PacketType>,
    },
    /// The server closed the connection; the session has been closed.
    Disconnected,
}

/// Stateful wrapper around one TCP connection plus its pending-task queues.
pub struct Session {
    addr: ServerAddr,
    stream: Option<TcpStream>,
    write_queue: VecDeque<Frame>,
    write_buf: BytesMut,
    /// Frames encoded into `write_buf`, with their bytes not yet written.
    unflushed: VecDeque<(usize, Frame)>,
    new_tasks: VecDeque<Task>,
    awaiting_ack: VecDeque<Task>,
    read_buf: FrameBuffer,
    events: Vec<SessionEvent>,
    receive_buffer_size: usize,
    max_payload_size: u32,
}

/// Open a TCP connection to `addr`, giving up after `connect_timeout`.
pub(crate) async fn connect(addr: &ServerAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let target = (addr.host.as_str(), addr.port);
    match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(GearwireError::Timeout(format!(
            "connecting to {} after {:?}",
            addr, connect_timeout
        ))),
    }
}

impl Session {
    /// Create an unopened session.
    pub fn new(addr: ServerAddr, receive_buffer_size: usize, max_payload_size: u32) -> Self {
        Self {
            addr,
            stream: None,
            write_queue: VecDeque::new(),
            write_buf: BytesMut::new(),
            unflushed: VecDeque::new(),
            new_tasks: VecDeque::new(),
            awaiting_ack: VecDeque::new(),
            read_buf: FrameBuffer::with_capacity_and_max_payload(
                receive_buffer_size,
                max_payload_size,
            ),
            events: Vec::new(),
            receive_buffer_size,
            max_payload_size,
        }
    }

    #[inline]
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Connect to the server.
    ///
    /// # Errors
    ///
    /// Fails if the session is already open, the connect times out, or the
    /// connect itself fails.
    pub async fn open(&mut self, connect_timeout: Duration) -> Result<()> {
        if self.is_open() {
            return Err(GearwireError::InvalidState(format!(
                "session {} is already open",
                self.addr
            )));
        }
        let stream = connect(&self.addr, connect_timeout).await?;
        self.attach(stream)
    }

    /// Open the session on a stream connected with [`connect`].
    pub(crate) fn attach(&mut self, stream: TcpStream) -> Result<()> {
        if self.is_open() {
            return Err(GearwireError::InvalidState(format!(
                "session {} is already open",
                self.addr
            )));
        }
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.read_buf =
            FrameBuffer::with_capacity_and_max_payload(self.receive_buffer_size, self.max_payload_size);
        info!("Session {} has been opened", self.addr);
        Ok(())
    }

    /// Close the socket and release every queue. Pending tasks are dropped.
    pub fn close(&mut self) {
        if self.stream.take().is_none() {
            return;
        }
        self.write_queue.clear();
        self.write_buf.clear();
        self.unflushed.clear();
        self.new_tasks.clear();
        self.awaiting_ack.clear();
        self.read_buf.clear();
        info!("Session {} has been closed", self.addr);
    }

    /// Queue a task's request for sending.
    ///
    /// # Errors
    ///
    /// Fails if the session is not open, the task is not NEW, or its
    /// request is too large to frame.
    pub fn submit(&mut self, task: Task) -> Result<()> {
        if !self.is_open() {
            return Err(GearwireError::InvalidState(format!(
                "session {} is not open",
                self.addr
            )));
        }
        if task.state() != TaskState::New {
            return Err(GearwireError::InvalidState(format!(
                "cannot submit task in state {}",
                task.state()
            )));
        }
        task.request().header()?;
        debug!("Session {} queued {}", self.addr, task.request_type());
        self.write_queue.push_back(task.request().clone());
        self.new_tasks.push_back(task);
        Ok(())
    }

    /// Queue a request frame that needs no response handler.
    pub fn submit_frame(&mut self, frame: Frame) -> Result<()> {
        self.submit(Task::fire_and_forget(frame)?)
    }

    /// Whether frames or encoded bytes are waiting to be written.
    pub fn has_data_to_write(&self) -> bool {
        self.is_open() && (!self.write_queue.is_empty() || !self.write_buf.is_empty())
    }

    /// Readiness this session currently needs.
    pub fn interest(&self) -> Interest {
        if self.has_data_to_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Tasks not yet written plus tasks waiting for acknowledgement.
    pub fn active_tasks(&self) -> usize {
        self.new_tasks.len() + self.awaiting_ack.len()
    }

    /// Events queued by previous calls to [`Session::drive_io`].
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Write queued frames and read available responses without blocking.
    ///
    /// # Errors
    ///
    /// Surfaces socket errors and fatal decode errors. End-of-stream closes
    /// the session and queues [`SessionEvent::Disconnected`] instead.
    pub fn drive_io(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(GearwireError::InvalidState(format!(
                "cannot drive I/O on closed session {}",
                self.addr
            )));
        }

        while let Some(frame) = self.write_queue.pop_front() {
            frame.encode_into(&mut self.write_buf)?;
            self.unflushed.push_back((frame.encoded_len(), frame));
        }
        self.flush()?;
        self.read_available()
    }

    fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let Some(stream) = self.stream.as_ref() else {
                return Ok(());
            };
            let written = match stream.try_write(&self.write_buf) {
                Ok(0) => return Err(GearwireError::ConnectionClosed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            trace!("Session {} wrote {} bytes", self.addr, written);
            self.write_buf.advance(written);
            self.on_bytes_written(written);
        }
        Ok(())
    }

    /// Feed the local REQ event of every frame whose last byte is now on
    /// the socket.
    fn on_bytes_written(&mut self, mut written: usize) {
        while written > 0 {
            let Some((remaining, _)) = self.unflushed.front_mut() else {
                return;
            };
            if *remaining > written {
                *remaining -= written;
                return;
            }
            written -= *remaining;
            if let Some((_, frame)) = self.unflushed.pop_front() {
                self.on_request_written(&frame);
            }
        }
    }

    fn read_available(&mut self) -> Result<()> {
        loop {
            let Some(stream) = self.stream.as_ref() else {
                return Ok(());
            };
            match stream.try_read_buf(self.read_buf.read_buf()) {
                Ok(0) => {
                    warn!("Session {} reached end of stream", self.addr);
                    self.close();
                    self.events.push(SessionEvent::Disconnected);
                    return Ok(());
                }
                Ok(n) => {
                    trace!("Session {} read {} bytes", self.addr, n);
                    for frame in self.read_buf.extract_frames()? {
                        self.on_response(frame);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Local REQ event: the head of the new-task queue has been written.
    fn on_request_written(&mut self, frame: &Frame) {
        let Some(mut task) = self.new_tasks.pop_front() else {
            warn!(
                "Session {} wrote {} with no task waiting to be sent",
                self.addr, frame.packet_type
            );
            return;
        };
        if let Err(e) = task.handle_event(frame) {
            warn!("Session {} failed to submit {}: {}", self.addr, frame.packet_type, e);
            return;
        }
        match task.state() {
            TaskState::Submitted => self.awaiting_ack.push_back(task),
            TaskState::Finished => {}
            other => warn!(
                "Task {} in invalid state {} after submission",
                frame.packet_type, other
            ),
        }
    }

    /// Match a response against the head of the acknowledgement queue.
    fn on_response(&mut self, frame: Frame) {
        debug!("Session {} handling RES/{}", self.addr, frame.packet_type);
        if !frame.packet_type.is_correlated() {
            self.events.push(SessionEvent::Response(frame));
            return;
        }

        let pending = self.awaiting_ack.front().map(Task::request_type);
        let accepted = pending
            .and_then(|request| frame.packet_type.acknowledges(request))
            .unwrap_or(false);
        if !accepted {
            if frame.packet_type == PacketType::Noop {
                trace!("Session {} ignoring NOOP while not sleeping", self.addr);
                return;
            }
            warn!(
                "Received {} response from {}, but last request was {}",
                frame.packet_type,
                self.addr,
                pending.map_or("nothing".to_string(), |p| p.to_string())
            );
            self.events.push(SessionEvent::Mismatch {
                response: frame.packet_type,
                pending,
            });
            return;
        }

        if let Some(task) = self.awaiting_ack.front_mut() {
            if let Err(e) = task.handle_event(&frame) {
                warn!("Session {}: {}", self.addr, e);
            }
            if task.state() > TaskState::Submitted {
                self.awaiting_ack.pop_front();
            } else {
                warn!(
                    "Task {} still submitted after acknowledgement from {}",
                    frame.packet_type, self.addr
                );
            }
        }
        self.events.push(SessionEvent::Response(frame));
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.addr)
            .field("open", &self.is_open())
            .field("queued_writes", &self.write_queue.len())
            .field("new_tasks", &self.new_tasks.len())
            .field("awaiting_ack", &self.awaiting_ack.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
    use crate::task::CapturedResponse;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Session, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut session = Session::new(ServerAddr::new("127.0.0.1", port), 64, DEFAULT_MAX_PAYLOAD_SIZE);
        let (open, accepted) = tokio::join!(session.open(Duration::from_secs(1)), listener.accept());
        open.unwrap();
        (session, accepted.unwrap().0)
    }

    /// Drive the session until it produces events or the attempts run out.
    async fn pump(session: &mut Session) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for _ in 0..100 {
            if let Some(stream) = session.stream() {
                let _ = tokio::time::timeout(
                    Duration::from_millis(20),
                    stream.ready(session.interest()),
                )
                .await;
            }
            if session.is_open() {
                session.drive_io().unwrap();
            }
            events.extend(session.drain_events());
            if !events.is_empty() {
                break;
            }
        }
        events
    }

    async fn read_frame(server: &mut tokio::net::TcpStream) -> Frame {
        let mut header = [0u8; HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        let header = crate::protocol::Header::decode(&header).unwrap().unwrap();
        let mut payload = vec![0u8; header.payload_length as usize];
        server.read_exact(&mut payload).await.unwrap();
        Frame::new(header.magic, header.packet_type, payload)
    }

    #[tokio::test]
    async fn test_write_feeds_local_request_event() {
        let (mut session, mut server) = connected_pair().await;

        let can_do = Task::fire_and_forget(Frame::request(PacketType::CanDo, &b"reverse"[..])).unwrap();
        let can_do_state = can_do.watch();
        let submit = Task::fire_and_forget(Frame::request_from_fields(
            PacketType::SubmitJob,
            &[b"reverse", b"u1", b"abc"],
        ))
        .unwrap();
        let submit_state = submit.watch();

        session.submit(can_do).unwrap();
        session.submit(submit).unwrap();
        assert!(session.has_data_to_write());
        assert_eq!(session.active_tasks(), 2);

        session.drive_io().unwrap();

        assert_eq!(*can_do_state.borrow(), TaskState::Finished);
        assert_eq!(*submit_state.borrow(), TaskState::Submitted);
        // Only the submission waits for an acknowledgement
        assert_eq!(session.active_tasks(), 1);

        assert_eq!(read_frame(&mut server).await.packet_type, PacketType::CanDo);
        let frame = read_frame(&mut server).await;
        assert_eq!(frame.payload(), b"reverse\0u1\0abc");
    }

    #[tokio::test]
    async fn test_response_correlated_with_head_task() {
        let (mut session, mut server) = connected_pair().await;

        let captured = CapturedResponse::new();
        let task = Task::with_handler(Frame::request(PacketType::EchoReq, &b"ping"[..]), captured.clone())
            .unwrap();
        let state = task.watch();
        session.submit(task).unwrap();
        session.drive_io().unwrap();
        read_frame(&mut server).await;

        server
            .write_all(&Frame::response(PacketType::EchoRes, &b"ping"[..]).encode().unwrap())
            .await
            .unwrap();

        let events = pump(&mut session).await;
        assert_eq!(
            events,
            vec![SessionEvent::Response(Frame::response(PacketType::EchoRes, &b"ping"[..]))]
        );
        assert_eq!(*state.borrow(), TaskState::Finished);
        assert_eq!(captured.take().unwrap().payload(), b"ping");
        assert_eq!(session.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_keeps_session_usable() {
        let (mut session, mut server) = connected_pair().await;

        let task = Task::with_handler(Frame::request(PacketType::GetStatus, &b"H:1"[..]), CapturedResponse::new())
            .unwrap();
        session.submit(task).unwrap();
        session.drive_io().unwrap();
        read_frame(&mut server).await;

        server
            .write_all(&Frame::response(PacketType::EchoRes, &b"x"[..]).encode().unwrap())
            .await
            .unwrap();

        let events = pump(&mut session).await;
        assert_eq!(
            events,
            vec![SessionEvent::Mismatch {
                response: PacketType::EchoRes,
                pending: Some(PacketType::GetStatus),
            }]
        );
        assert!(session.is_open());
        // Not dequeued
        assert_eq!(session.active_tasks(), 1);
    }

    #[tokio::test]
    async fn test_uncorrelated_and_stray_noop() {
        let (mut session, mut server) = connected_pair().await;

        // NOOP with nobody sleeping is dropped, WORK_DATA goes to the engine
        let mut bytes = Frame::response(PacketType::Noop, Bytes::new()).encode().unwrap().to_vec();
        bytes.extend_from_slice(&Frame::response(PacketType::WorkData, &b"H:1\0d"[..]).encode().unwrap());
        server.write_all(&bytes).await.unwrap();

        let events = pump(&mut session).await;
        assert_eq!(
            events,
            vec![SessionEvent::Response(Frame::response(PacketType::WorkData, &b"H:1\0d"[..]))]
        );
    }

    #[tokio::test]
    async fn test_large_response_grows_receive_buffer() {
        let (mut session, mut server) = connected_pair().await;

        let mut payload = b"H:1\0".to_vec();
        payload.extend(std::iter::repeat(b'z').take(1000));
        let frame = Frame::response(PacketType::WorkComplete, payload);
        server.write_all(&frame.encode().unwrap()).await.unwrap();

        let events = pump(&mut session).await;
        assert_eq!(events, vec![SessionEvent::Response(frame)]);
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_session() {
        let (mut session, server) = connected_pair().await;
        drop(server);

        let events = pump(&mut session).await;
        assert!(events.contains(&SessionEvent::Disconnected));
        assert!(!session.is_open());
        assert_eq!(session.active_tasks(), 0);
        assert!(session.drive_io().is_err());
    }

    #[tokio::test]
    async fn test_submit_requires_open_session() {
        let mut session = Session::new(ServerAddr::default(), 1024, DEFAULT_MAX_PAYLOAD_SIZE);
        let err = session
            .submit_frame(Frame::request(PacketType::CanDo, &b"f"[..]))
            .unwrap_err();
        assert!(matches!(err, GearwireError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_request_event_waits_for_socket_write() {
        let (mut session, mut server) = connected_pair().await;

        // Larger than the loopback socket buffers while the peer is not reading
        let size = 32 * 1024 * 1024;
        let task = Task::with_handler(
            Frame::request(PacketType::EchoReq, vec![b'x'; size]),
            CapturedResponse::new(),
        )
        .unwrap();
        let state = task.watch();
        session.submit(task).unwrap();

        session.drive_io().unwrap();
        assert_eq!(*state.borrow(), TaskState::New);
        assert!(session.has_data_to_write());

        let reader = tokio::spawn(async move {
            let frame = read_frame(&mut server).await;
            (frame.payload_len(), server)
        });
        for _ in 0..1000 {
            if *state.borrow() == TaskState::Submitted {
                break;
            }
            if let Some(stream) = session.stream() {
                let _ = tokio::time::timeout(
                    Duration::from_millis(20),
                    stream.ready(session.interest()),
                )
                .await;
            }
            session.drive_io().unwrap();
        }

        assert_eq!(*state.borrow(), TaskState::Submitted);
        assert!(!session.has_data_to_write());
        let (received, _server) = reader.await.unwrap();
        assert_eq!(received, size);
    }
}
