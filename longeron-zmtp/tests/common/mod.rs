//! In-memory doubles for the engine's collaborators.
//!
//! The reactor and session are contracts, so every end-to-end scenario can
//! run deterministically: transports are byte pipes, timers fire when the
//! test says so, and the session records everything the engine does to it.

#![allow(dead_code)]

use bytes::Bytes;
use tracing_subscriber::EnvFilter;
use longeron_core::error::ErrorReason;
use longeron_core::msg::Msg;
use longeron_core::options::Options;
use longeron_core::reactor::{Poller, TimerId};
use longeron_core::transport::Transport;
use longeron_zmtp::session::{PushError, Session};
use longeron_zmtp::StreamEngine;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

/// Opt-in engine tracing for a failing scenario: `RUST_LOG=trace`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct PipeEnd {
    pub data: VecDeque<u8>,
    pub closed: bool,
}

/// One direction-pair of an in-memory duplex connection.
pub struct DuplexTransport {
    rx: Rc<RefCell<PipeEnd>>,
    tx: Rc<RefCell<PipeEnd>>,
    name: &'static str,
}

impl DuplexTransport {
    /// Close what the peer would see: our outgoing half.
    pub fn close_tx(&self) {
        self.tx.borrow_mut().closed = true;
    }
}

/// Two connected transports.
pub fn duplex_pair() -> (DuplexTransport, DuplexTransport) {
    let a_to_b = Rc::new(RefCell::new(PipeEnd::default()));
    let b_to_a = Rc::new(RefCell::new(PipeEnd::default()));
    (
        DuplexTransport {
            rx: Rc::clone(&b_to_a),
            tx: Rc::clone(&a_to_b),
            name: "a",
        },
        DuplexTransport {
            rx: a_to_b,
            tx: b_to_a,
            name: "b",
        },
    )
}

impl Transport for DuplexTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut end = self.rx.borrow_mut();
        if end.data.is_empty() {
            if end.closed {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = end.data.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = end.data.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut end = self.tx.borrow_mut();
        if end.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        end.data.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<String> {
        Some(format!("tcp://127.0.0.1:0/{}", self.name))
    }

    fn peer_addr(&self) -> Option<String> {
        Some(format!("tcp://127.0.0.1:0/peer-of-{}", self.name))
    }
}

/// Single-ended transport fed and observed by the test script through a
/// shared handle (the engine owns the transport itself).
pub struct ScriptedTransport {
    input: Rc<RefCell<PipeEnd>>,
    written: Rc<RefCell<Vec<u8>>>,
}

#[derive(Clone)]
pub struct ScriptHandle {
    input: Rc<RefCell<PipeEnd>>,
    written: Rc<RefCell<Vec<u8>>>,
}

impl ScriptHandle {
    pub fn feed(&self, bytes: &[u8]) {
        self.input.borrow_mut().data.extend(bytes.iter().copied());
    }

    /// Further reads return EOF once the queued input drains.
    pub fn close(&self) {
        self.input.borrow_mut().closed = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.borrow().clone()
    }
}

pub fn scripted() -> (ScriptedTransport, ScriptHandle) {
    let input = Rc::new(RefCell::new(PipeEnd::default()));
    let written = Rc::new(RefCell::new(Vec::new()));
    (
        ScriptedTransport {
            input: Rc::clone(&input),
            written: Rc::clone(&written),
        },
        ScriptHandle { input, written },
    )
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut end = self.input.borrow_mut();
        if end.data.is_empty() {
            if end.closed {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = end.data.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = end.data.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn peer_addr(&self) -> Option<String> {
        Some("tcp://192.0.2.1:4444".to_owned())
    }

    fn local_addr(&self) -> Option<String> {
        Some("tcp://192.0.2.2:5555".to_owned())
    }
}

// ---------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct FakePoller {
    pub registered: bool,
    pub poll_in: bool,
    pub poll_out: bool,
    pub timers: Vec<(TimerId, Duration)>,
}

impl FakePoller {
    pub fn timer(&self, id: TimerId) -> Option<Duration> {
        self.timers.iter().find(|(t, _)| *t == id).map(|(_, d)| *d)
    }
}

impl Poller for FakePoller {
    fn add_fd(&mut self) {
        self.registered = true;
    }

    fn remove_fd(&mut self) {
        self.registered = false;
        self.poll_in = false;
        self.poll_out = false;
    }

    fn set_poll_in(&mut self) {
        self.poll_in = true;
    }

    fn reset_poll_in(&mut self) {
        self.poll_in = false;
    }

    fn set_poll_out(&mut self) {
        self.poll_out = true;
    }

    fn reset_poll_out(&mut self) {
        self.poll_out = false;
    }

    fn add_timer(&mut self, after: Duration, id: TimerId) {
        self.timers.retain(|(t, _)| *t != id);
        self.timers.push((id, after));
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.timers.retain(|(t, _)| *t != id);
    }
}

// ---------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum TestEvent {
    Handshaken(u8),
    Disconnected,
    HandshakeFailed(String),
}

pub enum ZapMode {
    /// No authenticator configured.
    Disabled,
    /// Authenticator answers synchronously with this status.
    AutoReply(&'static [u8]),
    /// Request is parked; the test delivers the reply explicitly.
    Deferred,
}

pub struct FakeSession {
    pub pull_queue: VecDeque<Msg>,
    pub pushed: Vec<Msg>,
    /// `Some(n)`: refuse pushes beyond n queued messages (backpressure).
    pub push_capacity: Option<usize>,
    pub reject_pushes: bool,
    pub flushes: usize,

    pub zap_mode: ZapMode,
    pub zap_requests: Vec<Msg>,
    pub zap_replies: VecDeque<Msg>,

    pub errors: Vec<(bool, ErrorReason)>,
    pub events: Vec<TestEvent>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self {
            pull_queue: VecDeque::new(),
            pushed: Vec::new(),
            push_capacity: None,
            reject_pushes: false,
            flushes: 0,
            zap_mode: ZapMode::Disabled,
            zap_requests: Vec::new(),
            zap_replies: VecDeque::new(),
            errors: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl FakeSession {
    pub fn with_zap(mode: ZapMode) -> Self {
        Self {
            zap_mode: mode,
            ..Self::default()
        }
    }

    fn queue_reply(&mut self, status: &'static [u8]) {
        let parts: [&[u8]; 6] = [b"1.0", b"1", status, b"", b"test-user", b""];
        self.zap_replies.push_back(Msg::new(Bytes::new()).with_more(true));
        for (i, p) in parts.iter().enumerate() {
            self.zap_replies
                .push_back(Msg::new(Bytes::copy_from_slice(p)).with_more(i < 5));
        }
    }

    /// Deliver a deferred authenticator verdict.
    pub fn deliver_zap_reply(&mut self, status: &'static [u8]) {
        self.queue_reply(status);
    }

    pub fn pushed_payloads(&self) -> Vec<&[u8]> {
        self.pushed.iter().map(|m| m.data().as_ref()).collect()
    }
}

impl Session for FakeSession {
    fn pull_msg(&mut self) -> Option<Msg> {
        self.pull_queue.pop_front()
    }

    fn push_msg(&mut self, msg: Msg) -> Result<(), PushError> {
        if self.reject_pushes {
            return Err(PushError::Rejected);
        }
        if let Some(cap) = self.push_capacity {
            if self.pushed.len() >= cap {
                return Err(PushError::Full);
            }
        }
        self.pushed.push(msg);
        Ok(())
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }

    fn zap_enabled(&self) -> bool {
        !matches!(self.zap_mode, ZapMode::Disabled)
    }

    fn zap_connect(&mut self) -> io::Result<()> {
        if self.zap_enabled() {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }
    }

    fn read_zap_msg(&mut self) -> Option<Msg> {
        self.zap_replies.pop_front()
    }

    fn write_zap_msg(&mut self, msg: Msg) -> Result<(), PushError> {
        let last = !msg.has_more();
        self.zap_requests.push(msg);
        if last {
            if let ZapMode::AutoReply(status) = self.zap_mode {
                self.queue_reply(status);
            }
        }
        Ok(())
    }

    fn engine_error(&mut self, handshaked: bool, reason: ErrorReason) {
        self.errors.push((handshaked, reason));
    }

    fn event_handshaken(&mut self, _endpoint: &str, revision: u8) {
        self.events.push(TestEvent::Handshaken(revision));
    }

    fn event_disconnected(&mut self, _endpoint: &str) {
        self.events.push(TestEvent::Disconnected);
    }

    fn event_handshake_failed(&mut self, _endpoint: &str, status: &str) {
        self.events.push(TestEvent::HandshakeFailed(status.to_owned()));
    }
}

// ---------------------------------------------------------------------
// Peer harness
// ---------------------------------------------------------------------

/// An engine plus its collaborators, driven by hand.
pub struct Peer<T: Transport> {
    pub engine: StreamEngine<T>,
    pub poller: FakePoller,
    pub session: FakeSession,
}

impl<T: Transport> Peer<T> {
    pub fn new(transport: T, options: Options) -> Self {
        Self {
            engine: StreamEngine::new(transport, options),
            poller: FakePoller::default(),
            session: FakeSession::default(),
        }
    }

    pub fn with_session(transport: T, options: Options, session: FakeSession) -> Self {
        Self {
            engine: StreamEngine::new(transport, options),
            poller: FakePoller::default(),
            session,
        }
    }

    pub fn plug(&mut self) {
        self.engine.plug(&mut self.poller, &mut self.session);
    }

    /// One reactor turn: readable then writable, honoring the poll flags.
    pub fn turn(&mut self) {
        if self.poller.poll_in && !self.engine.terminated() {
            self.engine.in_event(&mut self.poller, &mut self.session);
        }
        if self.poller.poll_out && !self.engine.terminated() {
            self.engine.out_event(&mut self.poller, &mut self.session);
        }
    }

    /// Several turns, enough to settle any quiescent exchange.
    pub fn pump(&mut self) {
        for _ in 0..6 {
            self.turn();
        }
    }

    /// Queue an application message and kick the egress path.
    pub fn send(&mut self, msg: Msg) {
        self.session.pull_queue.push_back(msg);
        self.engine
            .restart_output(&mut self.poller, &mut self.session);
    }

    pub fn fire_timer(&mut self, id: TimerId) {
        assert!(
            self.poller.timer(id).is_some(),
            "firing a timer that is not armed: {id:?}"
        );
        self.poller.cancel_timer(id);
        self.engine
            .timer_event(id, &mut self.poller, &mut self.session);
    }

    pub fn restart_input(&mut self) {
        self.engine
            .restart_input(&mut self.poller, &mut self.session);
    }

    pub fn zap_msg_available(&mut self) {
        self.engine
            .zap_msg_available(&mut self.poller, &mut self.session);
    }
}

/// Pump two connected peers until both go quiet.
pub fn pump_pair<A: Transport, B: Transport>(a: &mut Peer<A>, b: &mut Peer<B>) {
    for _ in 0..16 {
        a.turn();
        b.turn();
    }
}
