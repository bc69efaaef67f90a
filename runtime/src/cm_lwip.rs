//! LWIP `ConnectionManager` variant (§4.4.3): "mirrors the LWIP socket API
//! aliases" over the same POSIX TCP state machine, with DNS optional — when
//! absent, only IPv4 literals are accepted.
//!
//! No LWIP FFI binding exists in this corpus's dependency stack (LWIP is a
//! bare-metal/embedded TCP/IP stack normally cross-compiled into a
//! firmware image, not linked into a hosted Rust binary), so this wraps
//! [`TcpConnectionManager`] — "mirrors the POSIX TCP state machine" taken
//! literally — and narrows `open` to the LWIP build's no-DNS mode: an
//! `address` that doesn't parse as an IPv4 literal is rejected before the
//! delegate ever resolves it.

use crate::cm_tcp::TcpConnectionManager;
use crate::connection::{ConnectionCallback, ConnectionId, ConnectionManager, EventSourceState};
use crate::eventloop::EventLoop;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;
use transport_support::kvmap::{KeyValueMap, Variant};
use transport_support::logging::Logger;
use transport_support::StatusCode;

/// LWIP `ConnectionManager`. IPv4-literal-only by construction (`dns:
/// false` is always in effect — this port never links a resolver into the
/// LWIP build, matching the embedded target the original compiles for).
pub struct LwipConnectionManager {
    delegate: TcpConnectionManager,
}

impl LwipConnectionManager {
    pub fn new(logger: Logger) -> Self {
        LwipConnectionManager { delegate: TcpConnectionManager::new(logger) }
    }

    pub fn with_send_retry_bound(logger: Logger, send_retry_bound: Duration) -> Self {
        LwipConnectionManager { delegate: TcpConnectionManager::with_send_retry_bound(logger, send_retry_bound) }
    }

    fn reject_dns_names(params: &KeyValueMap) -> Result<(), StatusCode> {
        match params.get("address") {
            Some(Variant::String(addr)) if Ipv4Addr::from_str(addr).is_err() => Err(StatusCode::BadInvalidArgument),
            Some(Variant::Array(items)) => {
                for item in items {
                    if let Variant::String(addr) = item {
                        if Ipv4Addr::from_str(addr).is_err() {
                            return Err(StatusCode::BadInvalidArgument);
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl ConnectionManager for LwipConnectionManager {
    fn protocol(&self) -> &'static str {
        "lwip"
    }

    fn state(&self) -> EventSourceState {
        self.delegate.state()
    }

    fn start(&mut self, event_loop: &mut EventLoop) -> Result<(), StatusCode> {
        self.delegate.start(event_loop)
    }

    fn stop(&mut self, event_loop: &mut EventLoop) {
        self.delegate.stop(event_loop)
    }

    fn open(
        &mut self,
        event_loop: &mut EventLoop,
        params: &KeyValueMap,
        callback: ConnectionCallback,
    ) -> Result<ConnectionId, StatusCode> {
        Self::reject_dns_names(params)?;
        self.delegate.open(event_loop, params, callback)
    }

    fn send(
        &mut self,
        connection_id: ConnectionId,
        params: &KeyValueMap,
        buf: crate::connection::NetworkBuffer,
    ) -> Result<(), StatusCode> {
        self.delegate.send(connection_id, params, buf)
    }

    fn shutdown(&mut self, event_loop: &mut EventLoop, connection_id: ConnectionId) -> Result<(), StatusCode> {
        self.delegate.shutdown(event_loop, connection_id)
    }

    fn alloc_network_buffer(&self, connection_id: ConnectionId, size: usize) -> crate::connection::NetworkBuffer {
        self.delegate.alloc_network_buffer(connection_id, size)
    }
}
