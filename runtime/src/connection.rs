//! Shared types every `ConnectionManager` variant (TCP, raw Ethernet, LWIP)
//! is built against: the `EventSource` lifecycle, the connection callback
//! contract, and the reserved-prefix `NetworkBuffer` that makes zero-copy
//! header prepending possible on the send path.

use crate::eventloop::EventLoop;
use transport_support::error::StatusCode;
use transport_support::kvmap::KeyValueMap;

/// `FRESH → STARTING → STARTED → STOPPING → STOPPED`. Only `Started` may
/// open new connections; `Stopping` rejects new opens and is expected to
/// drain to `Stopped` once every owned fd has torn down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventSourceState {
    Fresh,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl EventSourceState {
    #[inline]
    pub fn can_open(self) -> bool {
        matches!(self, EventSourceState::Started)
    }

    /// Whether `to` is a legal next state from `self`.
    pub fn can_transition_to(self, to: EventSourceState) -> bool {
        use EventSourceState::*;
        matches!(
            (self, to),
            (Fresh, Starting)
                | (Starting, Started)
                | (Starting, Stopping)
                | (Started, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Tracks an `EventSource`'s lifecycle and the count of fds it still owns,
/// enforcing the `fdsSize == 0 ∧ state == Stopping ⇒ Stopped` invariant.
pub struct EventSourceLifecycle {
    state: EventSourceState,
    open_fds: usize,
}

impl EventSourceLifecycle {
    pub fn new() -> Self {
        EventSourceLifecycle { state: EventSourceState::Fresh, open_fds: 0 }
    }

    pub fn state(&self) -> EventSourceState {
        self.state
    }

    pub fn transition_to(&mut self, to: EventSourceState) -> Result<(), StatusCode> {
        if !self.state.can_transition_to(to) {
            return Err(StatusCode::BadInternalError);
        }
        self.state = to;
        if self.state == EventSourceState::Stopping && self.open_fds == 0 {
            self.state = EventSourceState::Stopped;
        }
        Ok(())
    }

    pub fn fd_opened(&mut self) {
        self.open_fds += 1;
    }

    /// Call after an owned fd has fully torn down. Completes the
    /// `Stopping → Stopped` transition once the last fd is gone.
    pub fn fd_closed(&mut self) {
        self.open_fds = self.open_fds.saturating_sub(1);
        if self.state == EventSourceState::Stopping && self.open_fds == 0 {
            self.state = EventSourceState::Stopped;
        }
    }

    pub fn open_fd_count(&self) -> usize {
        self.open_fds
    }
}

/// Opaque per-manager connection handle. Stable across the connection's
/// lifetime; indices into the manager's own fd table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

/// State reported to a connection callback. Mirrors the three states a
/// connection passes through: an in-flight active-open, a live connection
/// (carrying zero or more payloads), and the single terminal teardown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Opening,
    Established,
    Closing,
}

/// Invoked by a `ConnectionManager` to report connection lifecycle events
/// and incoming payloads. `params` carries state-specific metadata
/// (`remote-address`, `listen-address`/`listen-port`, ...); `payload` is
/// empty except for `Established` deliveries that carry received bytes.
pub type ConnectionCallback = Box<dyn FnMut(ConnectionId, ConnectionState, &KeyValueMap, &[u8]) + Send>;

/// A send/receive buffer with a reserved prefix so transport headers can be
/// prepended without a copy. `allocNetworkBuffer`/`freeNetworkBuffer` in the
/// spec's vocabulary; `payload_capacity` bytes are usable by the caller,
/// `prefix_capacity` bytes before that are reserved for the manager's own
/// framing.
pub struct NetworkBuffer {
    data: Vec<u8>,
    prefix_capacity: usize,
    prefix_used: usize,
    payload_len: usize,
}

impl NetworkBuffer {
    pub fn new(prefix_capacity: usize, payload_capacity: usize) -> Self {
        NetworkBuffer {
            data: vec![0u8; prefix_capacity + payload_capacity],
            prefix_capacity,
            prefix_used: 0,
            payload_len: 0,
        }
    }

    /// The caller-visible payload region, writable up to the buffer's
    /// configured payload capacity.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.prefix_capacity..]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.prefix_capacity..self.prefix_capacity + self.payload_len]
    }

    pub fn set_payload_len(&mut self, len: usize) {
        assert!(len <= self.data.len() - self.prefix_capacity, "payload exceeds buffer capacity");
        self.payload_len = len;
    }

    /// Reserves the last `len` bytes of the prefix region for a header,
    /// returning a mutable slice to write it into. Headers are prepended
    /// innermost-first, matching how a manager wraps payload with its own
    /// framing before handing off to a lower layer.
    pub fn prepend_header(&mut self, len: usize) -> &mut [u8] {
        assert!(len <= self.prefix_capacity - self.prefix_used, "prefix capacity exhausted");
        self.prefix_used += len;
        let start = self.prefix_capacity - self.prefix_used;
        &mut self.data[start..start + len]
    }

    /// The full region actually on the wire: every prepended header plus
    /// the payload, in the order a receiver would parse them.
    pub fn as_wire_bytes(&self) -> &[u8] {
        let start = self.prefix_capacity - self.prefix_used;
        &self.data[start..self.prefix_capacity + self.payload_len]
    }
}

/// A connection's entry in its owning manager's fd table.
pub struct RegisteredFd {
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
}

/// Public contract shared by the TCP, raw-Ethernet, and LWIP variants.
/// `open`/`send`/`shutdown` validate parameters and return synchronously;
/// all connectivity changes and received payloads are reported later,
/// through the `ConnectionCallback` supplied to `open`.
pub trait ConnectionManager: Send {
    fn protocol(&self) -> &'static str;
    fn state(&self) -> EventSourceState;

    /// Starts the manager: `Fresh → Starting → Started`. Must be called
    /// before `open`.
    fn start(&mut self, event_loop: &mut EventLoop) -> Result<(), StatusCode>;

    /// Begins shutdown: `Started → Stopping`, tearing down every owned fd
    /// via the delayed-callback path. Completion (`Stopping → Stopped`) is
    /// observed through `state()`, not returned here.
    fn stop(&mut self, event_loop: &mut EventLoop);

    fn open(
        &mut self,
        event_loop: &mut EventLoop,
        params: &KeyValueMap,
        callback: ConnectionCallback,
    ) -> Result<ConnectionId, StatusCode>;

    /// `buf` must have been obtained from `alloc_network_buffer` for this
    /// same connection. `params` carries per-send options a variant may
    /// consult (e.g. the raw-Ethernet variant's `txtime*` transmission
    /// deadline); implementations that have no per-send options ignore it.
    fn send(&mut self, connection_id: ConnectionId, params: &KeyValueMap, buf: NetworkBuffer) -> Result<(), StatusCode>;

    /// Idempotent: shutting down an already-closing or unknown connection
    /// succeeds without effect beyond the eventual `Closing` callback that
    /// was already scheduled.
    fn shutdown(&mut self, event_loop: &mut EventLoop, connection_id: ConnectionId) -> Result<(), StatusCode>;

    fn alloc_network_buffer(&self, connection_id: ConnectionId, size: usize) -> NetworkBuffer;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_event_source_cannot_open() {
        let lifecycle = EventSourceLifecycle::new();
        assert!(!lifecycle.state().can_open());
    }

    #[test]
    fn legal_lifecycle_walk_reaches_started() {
        let mut lifecycle = EventSourceLifecycle::new();
        lifecycle.transition_to(EventSourceState::Starting).unwrap();
        lifecycle.transition_to(EventSourceState::Started).unwrap();
        assert!(lifecycle.state().can_open());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut lifecycle = EventSourceLifecycle::new();
        assert_eq!(lifecycle.transition_to(EventSourceState::Started).unwrap_err(), StatusCode::BadInternalError);
    }

    #[test]
    fn stopping_with_no_open_fds_completes_immediately() {
        let mut lifecycle = EventSourceLifecycle::new();
        lifecycle.transition_to(EventSourceState::Starting).unwrap();
        lifecycle.transition_to(EventSourceState::Started).unwrap();
        lifecycle.transition_to(EventSourceState::Stopping).unwrap();
        assert_eq!(lifecycle.state(), EventSourceState::Stopped);
    }

    #[test]
    fn stopping_waits_for_open_fds_to_drain() {
        let mut lifecycle = EventSourceLifecycle::new();
        lifecycle.transition_to(EventSourceState::Starting).unwrap();
        lifecycle.transition_to(EventSourceState::Started).unwrap();
        lifecycle.fd_opened();
        lifecycle.transition_to(EventSourceState::Stopping).unwrap();
        assert_eq!(lifecycle.state(), EventSourceState::Stopping);

        lifecycle.fd_closed();
        assert_eq!(lifecycle.state(), EventSourceState::Stopped);
    }

    #[test]
    fn network_buffer_prepends_headers_innermost_first() {
        let mut buf = NetworkBuffer::new(8, 16);
        buf.payload_mut()[..5].copy_from_slice(b"hello");
        buf.set_payload_len(5);

        buf.prepend_header(3).copy_from_slice(b"HDR");
        buf.prepend_header(2).copy_from_slice(b"L2");

        assert_eq!(buf.as_wire_bytes(), b"L2HDRhello");
    }
}
