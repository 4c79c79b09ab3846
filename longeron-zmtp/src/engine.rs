//! The stream engine controller.
//!
//! One engine per attached peer. It owns the transport and the byte
//! buffers, drives greeting → security handshake → message phases, and
//! routes frames between codec, mechanism and session. Everything happens
//! inside three reactor callbacks ([`StreamEngine::in_event`],
//! [`StreamEngine::out_event`], [`StreamEngine::timer_event`]) plus the
//! session-initiated restarts; there is no internal concurrency.
//!
//! The message plumbing is two re-wireable slots dispatched by the
//! controller: `next_msg` (where outbound messages come from) and
//! `process_msg` (where inbound messages go). Phase transitions re-point
//! the slots instead of swapping objects.

use crate::codec::{
    CodecError, Decoder, Encoder, RawDecoder, RawEncoder, V1Decoder, V1Encoder, V2Decoder,
    V2Encoder,
};
use crate::command::{parse_command, parse_short_string};
use crate::greeting::{Greeting, GreetingStatus, Revision};
use crate::heartbeat;
use crate::mechanism::{MechanismStatus, SecurityMechanism};
use crate::session::{PushError, Session};
use bytes::{Buf, Bytes, BytesMut};
use longeron_core::error::{EngineError, ErrorReason};
use longeron_core::metadata::{self, Metadata};
use longeron_core::msg::{flags, Msg};
use longeron_core::options::Options;
use longeron_core::reactor::{Poller, TimerId};
use longeron_core::socket_type::SocketType;
use longeron_core::transport::{is_retryable, Transport};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where the next outbound message comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NextMsgSlot {
    /// Our identity frame, once (v1/v2 message phase entry).
    Identity,
    /// Plain pull from the session (raw and v0-v2 message phases).
    PullFromSession,
    /// Security handshake command (v3 handshake).
    HandshakeCommand,
    /// Pull from session and run the mechanism transform (v3 message
    /// phase).
    PullAndEncode,
    /// One-shot PING, then back to `PullAndEncode`.
    ProducePing,
    /// One-shot PONG echoing the peer's context, then back to
    /// `PullAndEncode`.
    ProducePong(Bytes),
}

/// Where inbound messages go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessMsgSlot {
    /// First inbound frame is the peer identity (v0-v2).
    Identity,
    /// Raw payloads straight to the session.
    PushRawToSession,
    /// Framed data straight to the session (v0-v2 after identity).
    PushToSession,
    /// Security handshake command (v3 handshake).
    HandshakeCommand,
    /// One-shot after READY: emit the CREDENTIAL frame, then behave as
    /// `DecodeAndPush`.
    WriteCredential,
    /// Mechanism decode, command routing, push (v3 message phase).
    DecodeAndPush,
}

/// One per attached peer; drives a single connected stream.
pub struct StreamEngine<T: Transport> {
    transport: T,
    options: Options,
    endpoint: String,
    local_address: Option<String>,

    /// Bytes read but not yet decoded.
    inbuf: BytesMut,
    /// Scratch for one non-blocking read; sized at plug.
    read_chunk: Vec<u8>,
    /// Bytes encoded but not yet written.
    outbuf: BytesMut,
    out_batch: usize,

    greeting: Option<Greeting>,
    revision: Option<Revision>,
    decoder: Option<Box<dyn Decoder>>,
    encoder: Option<Box<dyn Encoder>>,
    mechanism: Option<SecurityMechanism>,

    next_slot: NextMsgSlot,
    process_slot: ProcessMsgSlot,
    /// Messages accepted from the wire but refused by the session
    /// (backpressure); retried in order by `restart_input`.
    pending_push: VecDeque<Msg>,

    peer_metadata: Option<Arc<Metadata>>,

    plugged: bool,
    terminated: bool,
    handshaking: bool,
    input_stopped: bool,
    output_stopped: bool,
    io_error: bool,
    /// A mechanism ERROR command is queued or in flight; terminate once
    /// it has drained.
    error_pending: bool,

    has_handshake_timer: bool,
    has_heartbeat_timer: bool,
    has_timeout_timer: bool,
    has_ttl_timer: bool,
}

impl<T: Transport> StreamEngine<T> {
    #[must_use]
    pub fn new(transport: T, options: Options) -> Self {
        let endpoint = transport.peer_addr().unwrap_or_default();
        let local_address = transport.local_addr();
        Self {
            transport,
            options,
            endpoint,
            local_address,
            inbuf: BytesMut::new(),
            read_chunk: Vec::new(),
            outbuf: BytesMut::new(),
            out_batch: 0,
            greeting: None,
            revision: None,
            decoder: None,
            encoder: None,
            mechanism: None,
            next_slot: NextMsgSlot::Identity,
            process_slot: ProcessMsgSlot::Identity,
            pending_push: VecDeque::new(),
            peer_metadata: None,
            plugged: false,
            terminated: false,
            handshaking: false,
            input_stopped: false,
            output_stopped: false,
            io_error: false,
            error_pending: false,
            has_handshake_timer: false,
            has_heartbeat_timer: false,
            has_timeout_timer: false,
            has_ttl_timer: false,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn handshaking(&self) -> bool {
        self.handshaking
    }

    #[must_use]
    pub fn input_stopped(&self) -> bool {
        self.input_stopped
    }

    #[must_use]
    pub fn output_stopped(&self) -> bool {
        self.output_stopped
    }

    /// The engine is unplugged and unusable after a fatal error.
    #[must_use]
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Register with the reactor and start the greeting (or, in raw mode,
    /// go straight to the message phase). Strictly once.
    pub fn plug(&mut self, poller: &mut dyn Poller, session: &mut dyn Session) {
        assert!(!self.plugged, "plug is strictly once");
        assert!(!self.terminated);
        self.plugged = true;

        // Batch buffers: configured size, bounded below by the socket
        // buffer so one callback can drain the kernel queue.
        let rcvbuf = self.transport.rcvbuf_len().unwrap_or(0);
        let sndbuf = self.transport.sndbuf_len().unwrap_or(0);
        self.read_chunk = vec![0; self.options.in_batch_size.max(rcvbuf)];
        self.out_batch = self.options.out_batch_size.max(sndbuf);

        poller.add_fd();
        poller.set_poll_in();
        poller.set_poll_out();

        if self.options.raw_socket {
            self.decoder = Some(Box::new(RawDecoder::new()));
            self.encoder = Some(Box::new(RawEncoder::new()));
            self.next_slot = NextMsgSlot::PullFromSession;
            self.process_slot = ProcessMsgSlot::PushRawToSession;
            self.handshaking = false;
            debug!(endpoint = %self.endpoint, "plugged raw engine");

            // Zero-length message announces the peer connect.
            let _ = session.push_msg(Msg::empty());
            session.flush();
        } else {
            self.handshaking = true;
            let mut greeting = Greeting::new(&self.options);
            greeting.take_output(&mut self.outbuf);
            self.greeting = Some(greeting);

            if !self.options.handshake_interval.is_zero() {
                poller.add_timer(self.options.handshake_interval, TimerId::Handshake);
                self.has_handshake_timer = true;
            }
            debug!(endpoint = %self.endpoint, "plugged, greeting queued");
        }

        // Speculative first turn: the peer may already have spoken, and
        // our greeting can usually go out without waiting for the reactor.
        self.in_event(poller, session);
        if !self.terminated {
            self.out_event(poller, session);
        }
    }

    /// Cancel timers, deregister, detach. Called on fatal error; the
    /// owner drops the engine afterwards.
    fn unplug(&mut self, poller: &mut dyn Poller) {
        assert!(self.plugged);
        if self.has_handshake_timer {
            poller.cancel_timer(TimerId::Handshake);
            self.has_handshake_timer = false;
        }
        if self.has_heartbeat_timer {
            poller.cancel_timer(TimerId::HeartbeatIvl);
            self.has_heartbeat_timer = false;
        }
        if self.has_timeout_timer {
            poller.cancel_timer(TimerId::HeartbeatTimeout);
            self.has_timeout_timer = false;
        }
        if self.has_ttl_timer {
            poller.cancel_timer(TimerId::HeartbeatTtl);
            self.has_ttl_timer = false;
        }
        poller.remove_fd();
        self.terminated = true;
    }

    fn error(&mut self, err: &EngineError, poller: &mut dyn Poller, session: &mut dyn Session) {
        let reason = err.reason();
        debug!(endpoint = %self.endpoint, %err, ?reason, "engine error");

        if self.handshaking && reason == ErrorReason::Protocol {
            session.event_handshake_failed(&self.endpoint, &err.to_string());
        }
        session.event_disconnected(&self.endpoint);

        // In raw mode the application learns about the disconnect through
        // a zero-length terminator.
        if self.options.raw_socket && reason == ErrorReason::Connection {
            let _ = session.push_msg(Msg::empty());
            session.flush();
        }

        let handshaked = !self.handshaking;
        self.io_error = true;
        self.unplug(poller);
        session.engine_error(handshaked, reason);
    }

    // ------------------------------------------------------------------
    // Readable
    // ------------------------------------------------------------------

    /// Reactor callback: the transport is readable.
    pub fn in_event(&mut self, poller: &mut dyn Poller, session: &mut dyn Session) {
        if self.terminated {
            return;
        }
        if let Err(err) = self.try_in_event(poller, session) {
            self.error(&err, poller, session);
        }
    }

    fn try_in_event(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        if self.revision.is_none() && !self.options.raw_socket {
            // Greeting phase: always try to read, the decision may hinge
            // on a single further byte.
            if self.read_once()?.is_none() && self.inbuf.is_empty() {
                return Ok(());
            }

            let status = {
                let greeting = self.greeting.as_mut().expect("greeting phase");
                greeting.advance(&mut self.inbuf, &self.options)?
            };
            let revealed = self
                .greeting
                .as_mut()
                .map_or(0, |g| g.take_output(&mut self.outbuf));
            if revealed > 0 {
                self.kick_output(poller);
            }

            match status {
                GreetingStatus::Reading => return Ok(()),
                GreetingStatus::Done(revision) => {
                    self.finalize_greeting(revision, poller, session)?;
                }
            }
            // Fall through: bytes trailing the greeting belong to the
            // decoder.
        }

        self.drain_input(true, poller, session)
    }

    /// Decode and process everything buffered, with at most one further
    /// socket read. Flushes the session before returning.
    fn drain_input(
        &mut self,
        mut may_read: bool,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        if self.input_stopped {
            return Ok(());
        }

        if self.inbuf.is_empty() {
            if !may_read || self.read_once()?.is_none() {
                session.flush();
                return Ok(());
            }
            may_read = false;
        }

        loop {
            let decoded = {
                let decoder = self.decoder.as_mut().expect("decoder exists past greeting");
                decoder.decode(&mut self.inbuf).map_err(codec_error)?
            };
            match decoded {
                Some(msg) => {
                    if !self.process_msg(msg, poller, session)? {
                        // Backpressure or a ZAP stall: stop reading until
                        // the session restarts us.
                        self.input_stopped = true;
                        poller.reset_poll_in();
                        break;
                    }
                }
                None => {
                    // Partial frame: allow the one read this callback is
                    // entitled to, then yield to the reactor.
                    if may_read && self.read_once()?.is_some() {
                        may_read = false;
                        continue;
                    }
                    break;
                }
            }
        }

        session.flush();
        Ok(())
    }

    /// One non-blocking read. `Ok(None)` means EAGAIN.
    fn read_once(&mut self) -> Result<Option<usize>, EngineError> {
        match self.transport.read(&mut self.read_chunk) {
            Ok(0) => Err(EngineError::PeerClosed),
            Ok(n) => {
                self.inbuf.extend_from_slice(&self.read_chunk[..n]);
                trace!(n, "read");
                Ok(Some(n))
            }
            Err(e) if is_retryable(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch one inbound message through the current `process_msg`
    /// slot. `Ok(false)` pauses input.
    fn process_msg(
        &mut self,
        msg: Msg,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<bool, EngineError> {
        // Any inbound frame is proof of life.
        if self.has_timeout_timer {
            poller.cancel_timer(TimerId::HeartbeatTimeout);
            self.has_timeout_timer = false;
        }
        if self.has_ttl_timer {
            poller.cancel_timer(TimerId::HeartbeatTtl);
            self.has_ttl_timer = false;
        }

        match self.process_slot {
            ProcessMsgSlot::HandshakeCommand => {
                {
                    let mechanism = self.mechanism.as_mut().expect("v3 handshake");
                    mechanism.process_handshake_command(&msg, session)?;
                }
                self.after_mechanism_step(poller, session)?;
                // The step usually queues a reply command; make sure the
                // writable side runs to send it.
                self.kick_output(poller);
                if self
                    .mechanism
                    .as_ref()
                    .is_some_and(SecurityMechanism::awaiting_zap_reply)
                {
                    // Serialize the mechanism with the authenticator: no
                    // application frames while the reply is pending.
                    return Ok(false);
                }
                Ok(true)
            }
            ProcessMsgSlot::Identity => {
                let mut identity = msg;
                identity.set_flags(flags::IDENTITY);
                let mut ok = self.push_or_stash(identity, session)?;
                self.process_slot = ProcessMsgSlot::PushToSession;

                // PUB-side socket facing an unversioned peer: nobody will
                // ever send us a subscription, so fabricate one.
                if self.revision == Some(Revision::Unversioned)
                    && self.options.socket_type.subscription_required()
                {
                    ok &= self.push_or_stash(Msg::new(Bytes::from_static(&[1])), session)?;
                }
                Ok(ok)
            }
            ProcessMsgSlot::PushRawToSession | ProcessMsgSlot::PushToSession => {
                self.push_or_stash(msg, session)
            }
            ProcessMsgSlot::WriteCredential | ProcessMsgSlot::DecodeAndPush => {
                let decoded = {
                    let mechanism = self.mechanism.as_mut().expect("v3 message phase");
                    mechanism.decode(msg)?
                };
                if decoded.is_command() {
                    return match self.route_command(decoded, poller)? {
                        None => Ok(true),
                        // Commands the engine does not own (SUBSCRIBE,
                        // CANCEL, extensions) ride the same backpressure
                        // path as data.
                        Some(upstream) => self.push_or_stash(upstream, session),
                    };
                }

                let mut ok = true;
                if self.process_slot == ProcessMsgSlot::WriteCredential {
                    self.process_slot = ProcessMsgSlot::DecodeAndPush;
                    let credential = self.mechanism.as_ref().and_then(|m| m.user_id().cloned());
                    if let Some(user_id) = credential {
                        ok &= self.push_or_stash(Msg::credential(user_id), session)?;
                    }
                }

                let mut delivered = decoded;
                if let Some(meta) = &self.peer_metadata {
                    delivered.set_metadata(Arc::clone(meta));
                }
                ok &= self.push_or_stash(delivered, session)?;
                Ok(ok)
            }
        }
    }

    /// Route a post-handshake command frame. `Some(msg)` hands it to the
    /// session.
    fn route_command(
        &mut self,
        msg: Msg,
        poller: &mut dyn Poller,
    ) -> Result<Option<Msg>, EngineError> {
        {
            let cmd = parse_command(msg.data())?;
            match cmd.name {
                heartbeat::PING => {
                    let ping = heartbeat::parse_ping(msg.data())?;
                    if !ping.ttl.is_zero() {
                        poller.add_timer(ping.ttl, TimerId::HeartbeatTtl);
                        self.has_ttl_timer = true;
                    }
                    self.next_slot = NextMsgSlot::ProducePong(ping.context);
                    self.kick_output(poller);
                    return Ok(None);
                }
                heartbeat::PONG => return Ok(None),
                b"ERROR" => {
                    let (status, _) = parse_short_string(cmd.data)?;
                    return Err(EngineError::PeerError(
                        String::from_utf8_lossy(status).into_owned(),
                    ));
                }
                _ => {}
            }
        }
        trace!("forwarding unrecognized command upstream");
        Ok(Some(msg))
    }

    /// Push to the session, preserving order behind anything already
    /// stalled. `Ok(false)` = backpressure.
    fn push_or_stash(&mut self, msg: Msg, session: &mut dyn Session) -> Result<bool, EngineError> {
        if !self.pending_push.is_empty() {
            self.pending_push.push_back(msg);
            return Ok(false);
        }
        match session.push_msg(msg.clone()) {
            Ok(()) => Ok(true),
            Err(PushError::Full) => {
                self.pending_push.push_back(msg);
                Ok(false)
            }
            Err(PushError::Rejected) => Err(EngineError::SessionRejected),
        }
    }

    // ------------------------------------------------------------------
    // Writable
    // ------------------------------------------------------------------

    /// Reactor callback: the transport is writable.
    pub fn out_event(&mut self, poller: &mut dyn Poller, session: &mut dyn Session) {
        if self.terminated {
            return;
        }
        if let Err(err) = self.try_out_event(poller, session) {
            self.error(&err, poller, session);
        }
    }

    fn try_out_event(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        if self.io_error {
            return Ok(());
        }

        if self.outbuf.is_empty() {
            self.refill_outbuf(poller, session)?;
        }

        if self.outbuf.is_empty() {
            if self.error_pending {
                // The mechanism's ERROR command has fully drained.
                return Err(EngineError::Mechanism("handshake refused"));
            }
            self.output_stopped = true;
            poller.reset_poll_out();
            return Ok(());
        }

        match self.transport.write(&self.outbuf) {
            Ok(n) => {
                trace!(n, "wrote");
                self.outbuf.advance(n);
            }
            Err(e) if is_retryable(&e) => return Ok(()),
            Err(e) => {
                // Keep reads alive: the peer may still be sending us a
                // final ERROR or close.
                debug!(endpoint = %self.endpoint, err = %e, "write failed, output stopped");
                self.io_error = true;
                self.output_stopped = true;
                poller.reset_poll_out();
                return Ok(());
            }
        }

        if self.outbuf.is_empty() {
            // Fully drained: stage whatever is ready next (possibly a
            // terminal ERROR command) before judging the error flushed.
            self.refill_outbuf(poller, session)?;
            if self.outbuf.is_empty() && self.error_pending {
                let encoder_idle = self.encoder.as_ref().map_or(true, |e| !e.has_msg());
                if encoder_idle {
                    return Err(EngineError::Mechanism("handshake refused"));
                }
            }
        }
        Ok(())
    }

    /// Pump the encoder until the batch threshold is met or messages run
    /// out.
    fn refill_outbuf(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        if self.encoder.is_none() {
            // Greeting phase: outbuf is fed directly by the greeting.
            return Ok(());
        }

        while self.outbuf.len() < self.out_batch {
            let budget = self.out_batch - self.outbuf.len();
            let n = {
                let encoder = self.encoder.as_mut().expect("checked above");
                encoder.encode(&mut self.outbuf, budget)
            };
            if n > 0 {
                continue;
            }
            // Encoder exhausted its message: feed it the next one.
            match self.next_msg(poller, session)? {
                Some(msg) => {
                    let encoder = self.encoder.as_mut().expect("checked above");
                    encoder.load_msg(msg);
                }
                None => break,
            }
        }
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.encoded();
        }
        Ok(())
    }

    /// Dispatch through the current `next_msg` slot.
    fn next_msg(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<Option<Msg>, EngineError> {
        match self.next_slot.clone() {
            NextMsgSlot::Identity => {
                self.next_slot = NextMsgSlot::PullFromSession;
                Ok(Some(Msg::identity(self.options.identity.clone())))
            }
            NextMsgSlot::PullFromSession => Ok(session.pull_msg()),
            NextMsgSlot::HandshakeCommand => {
                let cmd = {
                    let mechanism = self.mechanism.as_mut().expect("v3 handshake");
                    mechanism.next_handshake_command()?
                };
                self.after_mechanism_step(poller, session)?;
                if cmd.is_some() {
                    return Ok(cmd);
                }
                // The mechanism may have just become ready; if so the slot
                // changed and application traffic can follow immediately.
                if self.next_slot == NextMsgSlot::HandshakeCommand {
                    Ok(None)
                } else {
                    self.next_msg(poller, session)
                }
            }
            NextMsgSlot::PullAndEncode => match session.pull_msg() {
                Some(msg) => {
                    let mechanism = self.mechanism.as_mut().expect("v3 message phase");
                    Ok(Some(mechanism.encode(msg)?))
                }
                None => Ok(None),
            },
            NextMsgSlot::ProducePing => {
                self.next_slot = NextMsgSlot::PullAndEncode;

                let take = self
                    .options
                    .heartbeat_context
                    .len()
                    .min(heartbeat::MAX_CONTEXT);
                let ping = heartbeat::build_ping(
                    self.options.heartbeat_ttl_deciseconds(),
                    &self.options.heartbeat_context[..take],
                );

                let timeout = self.options.effective_heartbeat_timeout();
                if !timeout.is_zero() && !self.has_timeout_timer {
                    poller.add_timer(timeout, TimerId::HeartbeatTimeout);
                    self.has_timeout_timer = true;
                }

                let mechanism = self.mechanism.as_mut().expect("heartbeats are v3");
                Ok(Some(mechanism.encode(ping)?))
            }
            NextMsgSlot::ProducePong(context) => {
                self.next_slot = NextMsgSlot::PullAndEncode;
                let pong = heartbeat::build_pong(&context);
                let mechanism = self.mechanism.as_mut().expect("heartbeats are v3");
                Ok(Some(mechanism.encode(pong)?))
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Reactor callback: a one-shot timer fired.
    pub fn timer_event(&mut self, id: TimerId, poller: &mut dyn Poller, session: &mut dyn Session) {
        if self.terminated {
            return;
        }
        match id {
            TimerId::Handshake => {
                self.has_handshake_timer = false;
                if self.handshaking {
                    let err = EngineError::HandshakeTimeout(self.options.handshake_interval);
                    self.error(&err, poller, session);
                }
            }
            TimerId::HeartbeatIvl => {
                // The interval timer re-arms itself.
                poller.add_timer(self.options.heartbeat_interval, TimerId::HeartbeatIvl);
                self.next_slot = NextMsgSlot::ProducePing;
                self.restart_output(poller, session);
            }
            TimerId::HeartbeatTimeout => {
                self.has_timeout_timer = false;
                self.error(&EngineError::HeartbeatTimeout, poller, session);
            }
            TimerId::HeartbeatTtl => {
                self.has_ttl_timer = false;
                self.error(&EngineError::TtlExpired, poller, session);
            }
        }
    }

    // ------------------------------------------------------------------
    // Session-initiated restarts
    // ------------------------------------------------------------------

    /// The session drained a pipe slot: retry the stalled messages,
    /// resume the drain loop, re-arm readable polling, speculatively
    /// re-read.
    pub fn restart_input(&mut self, poller: &mut dyn Poller, session: &mut dyn Session) {
        if self.terminated || !self.input_stopped {
            return;
        }
        if let Err(err) = self.try_restart_input(poller, session) {
            self.error(&err, poller, session);
        }
    }

    fn try_restart_input(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        // A ZAP stall is resumed by `zap_msg_available`, never here.
        if self
            .mechanism
            .as_ref()
            .is_some_and(SecurityMechanism::awaiting_zap_reply)
        {
            return Ok(());
        }

        while let Some(front) = self.pending_push.front() {
            match session.push_msg(front.clone()) {
                Ok(()) => {
                    self.pending_push.pop_front();
                }
                Err(PushError::Full) => {
                    session.flush();
                    return Ok(());
                }
                Err(PushError::Rejected) => return Err(EngineError::SessionRejected),
            }
        }

        self.input_stopped = false;
        poller.set_poll_in();
        self.drain_input(true, poller, session)
    }

    /// The session queued an outbound message: re-arm writable polling
    /// and attempt a speculative write, saving an event-loop hop on
    /// reply-heavy workloads.
    pub fn restart_output(&mut self, poller: &mut dyn Poller, session: &mut dyn Session) {
        if self.terminated || self.io_error {
            return;
        }
        if self.output_stopped {
            self.output_stopped = false;
            poller.set_poll_out();
        }
        self.out_event(poller, session);
    }

    /// The session's ZAP pipe became readable.
    pub fn zap_msg_available(&mut self, poller: &mut dyn Poller, session: &mut dyn Session) {
        if self.terminated {
            return;
        }
        if let Err(err) = self.try_zap_msg_available(poller, session) {
            self.error(&err, poller, session);
        }
    }

    fn try_zap_msg_available(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        {
            let Some(mechanism) = self.mechanism.as_mut() else {
                return Ok(());
            };
            mechanism.zap_msg_available(session)?;
        }
        let still_waiting = self
            .mechanism
            .as_ref()
            .is_some_and(SecurityMechanism::awaiting_zap_reply);
        if still_waiting {
            return Ok(());
        }

        self.after_mechanism_step(poller, session)?;

        // Resume the input the ZAP wait had paused, and flush whatever
        // the reply unlocked (READY or ERROR).
        if self.input_stopped {
            self.input_stopped = false;
            poller.set_poll_in();
        }
        self.kick_output(poller);
        self.try_out_event(poller, session)?;
        self.drain_input(true, poller, session)
    }

    // ------------------------------------------------------------------
    // Phase transitions
    // ------------------------------------------------------------------

    fn finalize_greeting(
        &mut self,
        revision: Revision,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        debug!(endpoint = %self.endpoint, ?revision, "greeting complete");
        self.revision = Some(revision);
        self.greeting = None;
        let max = self.options.max_msg_size;

        if session.zap_enabled() && revision != Revision::V3 {
            return Err(EngineError::ZapRequiresV3);
        }

        match revision {
            Revision::Unversioned => {
                self.decoder = Some(Box::new(V1Decoder::new(max)));
                let mut encoder = V1Encoder::new();

                // The identity frame's header went out inside the greeting
                // signature; encode the frame and drop the header bytes.
                let identity = self.options.identity.clone();
                let header_len = V1Encoder::header_len(identity.len());
                encoder.load_msg(Msg::identity(identity));
                let mut scratch = BytesMut::new();
                while encoder.encode(&mut scratch, usize::MAX) > 0 {}
                self.outbuf.extend_from_slice(&scratch[header_len..]);

                self.encoder = Some(Box::new(encoder));
                self.next_slot = NextMsgSlot::PullFromSession;
                self.process_slot = ProcessMsgSlot::Identity;
                self.handshake_done(poller, session, revision);
            }
            Revision::V1 | Revision::V2 => {
                if revision == Revision::V1 {
                    self.decoder = Some(Box::new(V1Decoder::new(max)));
                    self.encoder = Some(Box::new(V1Encoder::new()));
                } else {
                    self.decoder = Some(Box::new(V2Decoder::new(max)));
                    self.encoder = Some(Box::new(V2Encoder::new()));
                }
                // Identity travels as the first framed message.
                self.next_slot = NextMsgSlot::Identity;
                self.process_slot = ProcessMsgSlot::Identity;
                self.handshake_done(poller, session, revision);
            }
            Revision::V3 => {
                self.decoder = Some(Box::new(V2Decoder::new(max)));
                self.encoder = Some(Box::new(V2Encoder::new()));
                self.mechanism = Some(SecurityMechanism::new(
                    &self.options,
                    self.local_address.as_deref(),
                    Some(&self.endpoint),
                )?);
                self.next_slot = NextMsgSlot::HandshakeCommand;
                self.process_slot = ProcessMsgSlot::HandshakeCommand;
            }
        }

        self.kick_output(poller);
        Ok(())
    }

    /// Leave the handshake: cancel the deadline, tell the socket layer.
    fn handshake_done(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
        revision: Revision,
    ) {
        self.handshaking = false;
        if self.has_handshake_timer {
            poller.cancel_timer(TimerId::Handshake);
            self.has_handshake_timer = false;
        }
        session.event_handshaken(&self.endpoint, revision.number());
    }

    /// Run after every mechanism interaction: promote terminal states.
    fn after_mechanism_step(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        let status = self.mechanism.as_ref().expect("mechanism step").status();
        match status {
            MechanismStatus::Handshaking => {}
            MechanismStatus::Ready => {
                if self.handshaking {
                    self.mechanism_ready(poller, session)?;
                }
            }
            MechanismStatus::Error => {
                // Let the ERROR command drain, then fail.
                self.error_pending = true;
                self.kick_output(poller);
            }
        }
        Ok(())
    }

    fn mechanism_ready(
        &mut self,
        poller: &mut dyn Poller,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        let mut meta = self
            .mechanism
            .as_ref()
            .expect("mechanism ready")
            .peer_metadata();

        if let Some(peer_type) = meta.get(metadata::SOCKET_TYPE) {
            match SocketType::from_wire(peer_type) {
                Some(pt) if self.options.socket_type.is_compatible(pt) => {}
                _ => return Err(EngineError::Mechanism("incompatible socket types")),
            }
        }

        let revision = self.revision.expect("greeting settled");
        self.handshake_done(poller, session, revision);

        if !self.endpoint.is_empty() {
            meta.insert(
                metadata::PEER_ADDRESS,
                Bytes::copy_from_slice(self.endpoint.as_bytes()),
            );
        }
        self.peer_metadata = Some(Arc::new(meta));

        self.next_slot = NextMsgSlot::PullAndEncode;
        self.process_slot = ProcessMsgSlot::WriteCredential;

        if !self.options.heartbeat_interval.is_zero() {
            poller.add_timer(self.options.heartbeat_interval, TimerId::HeartbeatIvl);
            self.has_heartbeat_timer = true;
        }
        self.kick_output(poller);
        debug!(endpoint = %self.endpoint, "mechanism ready");
        Ok(())
    }

    /// Make sure the writable side will run again.
    fn kick_output(&mut self, poller: &mut dyn Poller) {
        if self.io_error {
            return;
        }
        self.output_stopped = false;
        poller.set_poll_out();
    }
}

fn codec_error(err: CodecError) -> EngineError {
    match err {
        CodecError::TooLarge { size, max } => EngineError::MessageTooLarge { size, max },
        CodecError::ReservedBits => EngineError::Framing("reserved bits set"),
        CodecError::BadLength => EngineError::Framing("malformed frame length"),
    }
}
