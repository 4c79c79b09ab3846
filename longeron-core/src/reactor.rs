//! Reactor (poller) contract consumed by the engine.
//!
//! The engine never blocks; it reacts to three callbacks the reactor
//! delivers on its thread: readable, writable, timer fired. In the other
//! direction the engine asks the reactor to arm or disarm readiness
//! polling and one-shot timers through this trait.
//!
//! The contract mirrors the reactor side of the engine lifecycle:
//!
//! - `add_fd` at plug, `remove_fd` at unplug (strictly bracketed; the
//!   reactor guarantees no callback fires after `remove_fd` returns).
//! - Poll flags are level-style: `set_poll_in` keeps readable callbacks
//!   coming until `reset_poll_in`.
//! - Timers are one-shot and identified by [`TimerId`]; re-arming an
//!   already-armed id replaces the pending deadline.

use std::time::Duration;

/// Identifies the engine's one-shot timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Overall handshake deadline.
    Handshake,
    /// Periodic PING production.
    HeartbeatIvl,
    /// PONG grace period after we sent a PING.
    HeartbeatTimeout,
    /// Peer-announced TTL.
    HeartbeatTtl,
}

/// What the engine asks of its reactor.
pub trait Poller {
    /// Register the engine's transport with the reactor.
    fn add_fd(&mut self);

    /// Deregister; no callbacks may fire afterwards.
    fn remove_fd(&mut self);

    fn set_poll_in(&mut self);
    fn reset_poll_in(&mut self);
    fn set_poll_out(&mut self);
    fn reset_poll_out(&mut self);

    /// Arm a one-shot timer.
    fn add_timer(&mut self, after: Duration, id: TimerId);

    /// Cancel a pending timer; a no-op if `id` is not armed.
    fn cancel_timer(&mut self, id: TimerId);
}
