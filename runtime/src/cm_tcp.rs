//! Stream TCP `ConnectionManager`, ported from `UA_ClientConnectionTCP`/
//! `ServerNetworkLayerTCP`: listen/accept and active-open state machines
//! sharing one manager-wide rx buffer and fd table, as described in §4.4.1.
//!
//! Every fd registration or deregistration happens on the delayed-callback
//! path (`EventLoopHandle::schedule`), never from inside an `FdCallback`
//! itself — the callback only gets an `EventMask`, not `&mut EventLoop`,
//! mirroring the reason `RegisteredFD` teardown is delayed in the original.
//! A single `FdCallback` per connection defers straight to `schedule`;
//! the delayed closure re-reads the connection's current state (`Opening`
//! vs `Established`) to decide whether it's looking at a connect-readiness
//! event or a read-readiness event.

use crate::connection::{
    ConnectionCallback, ConnectionId, ConnectionManager, ConnectionState, EventSourceLifecycle, EventSourceState,
    NetworkBuffer,
};
use crate::eventloop::{EventLoop, EventLoopHandle, EventMask, FdToken};
use ctor::ctor;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use transport_support::kvmap::{self, KeyValueMap, ParamRestriction, Variant};
use transport_support::logging::{info, Logger};
use transport_support::StatusCode;

/// Writes to a TCP socket whose peer has vanished normally raise `SIGPIPE`
/// on Linux/BSD; unhandled, the whole process would die rather than
/// surfacing `ConnectionClosed` through the usual callback path. Ignored
/// once, process-wide, matching the original's per-socket `SO_NOSIGPIPE`.
#[ctor]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn restrictions() -> Vec<ParamRestriction> {
    vec![
        ParamRestriction::optional("recv-bufsize", "UInt32"),
        ParamRestriction::optional("address", "String"),
        ParamRestriction::required("port", "UInt16"),
        ParamRestriction::optional("listen", "Boolean"),
        ParamRestriction::optional("validate", "Boolean"),
        ParamRestriction::optional("reuse", "Boolean"),
    ]
}

fn get_string(map: &KeyValueMap, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Variant::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn get_u16(map: &KeyValueMap, key: &str) -> Option<u16> {
    match map.get(key) {
        Some(Variant::UInt16(v)) => Some(*v),
        _ => None,
    }
}

fn get_u32(map: &KeyValueMap, key: &str) -> Option<u32> {
    match map.get(key) {
        Some(Variant::UInt32(v)) => Some(*v),
        _ => None,
    }
}

fn get_bool(map: &KeyValueMap, key: &str, default: bool) -> bool {
    match map.get(key) {
        Some(Variant::Boolean(v)) => *v,
        _ => default,
    }
}

fn empty_params() -> KeyValueMap {
    KeyValueMap::new()
}

enum ConnKind {
    Listener(TcpListener),
    Active(TcpStream),
}

struct Conn {
    kind: ConnKind,
    token: FdToken,
    state: ConnectionState,
    /// Shared so an accepted connection can reuse the listener's callback
    /// (the manager-level contract is one callback per `open`, not per
    /// accepted peer) without an unsafe aliasing trick.
    callback: Arc<Mutex<ConnectionCallback>>,
}

struct Inner {
    logger: Logger,
    lifecycle: EventSourceLifecycle,
    recv_bufsize: usize,
    send_retry_bound: Duration,
    next_id: u64,
    connections: HashMap<ConnectionId, Conn>,
}

impl Inner {
    fn alloc_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Stream TCP `ConnectionManager`. Cheaply cloneable; the shared `Inner` is
/// what `FdCallback`s captured from [`open`](ConnectionManager::open)
/// actually mutate, behind a single per-manager mutex (§5: "every mutable
/// EventSource ... protected by a per-object mutex").
#[derive(Clone)]
pub struct TcpConnectionManager {
    inner: Arc<Mutex<Inner>>,
}

impl TcpConnectionManager {
    pub fn new(logger: Logger) -> Self {
        Self::with_send_retry_bound(logger, Duration::from_millis(100))
    }

    pub fn with_send_retry_bound(logger: Logger, send_retry_bound: Duration) -> Self {
        TcpConnectionManager {
            inner: Arc::new(Mutex::new(Inner {
                logger,
                lifecycle: EventSourceLifecycle::new(),
                recv_bufsize: 65536,
                send_retry_bound,
                next_id: 1,
                connections: HashMap::new(),
            })),
        }
    }
}

fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))
}

fn make_socket(addr: &SocketAddr, reuse: bool) -> io::Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    Ok(socket)
}

/// Bounded `poll(2)`-based writability wait, the non-blocking retry loop
/// `send` falls back to on `EAGAIN`/`EWOULDBLOCK`/`EINTR` (§4.4.1, §5).
fn wait_writable(fd: i32, bound: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + bound;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let mut pollfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
        let rc = unsafe { libc::poll(&mut pollfd, 1, remaining.as_millis() as i32) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }
        if pollfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
            return Ok(true);
        }
    }
}

fn write_all_retrying(stream: &mut TcpStream, mut buf: &[u8], bound: Duration) -> Result<(), StatusCode> {
    let fd = stream.as_raw_fd();
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(StatusCode::BadConnectionClosed),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                match wait_writable(fd, bound) {
                    Ok(true) => continue,
                    _ => return Err(StatusCode::BadConnectionClosed),
                }
            }
            Err(_) => return Err(StatusCode::BadConnectionClosed),
        }
    }
    Ok(())
}

/// Schedules the terminal `Closing` callback and fd teardown. Safe to call
/// more than once for the same id: the second call finds no entry and is a
/// no-op, matching `shutdown`'s idempotence (§8).
fn schedule_teardown(inner: &Arc<Mutex<Inner>>, handle: &EventLoopHandle, id: ConnectionId) {
    let inner = Arc::clone(inner);
    handle.schedule(move |event_loop| {
        let mut guard = inner.lock().unwrap();
        let Some(mut conn) = guard.connections.remove(&id) else { return };
        match &mut conn.kind {
            ConnKind::Listener(l) => {
                let _ = event_loop.deregister_fd(l, conn.token);
            }
            ConnKind::Active(s) => {
                let _ = event_loop.deregister_fd(s, conn.token);
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
        }
        guard.lifecycle.fd_closed();
        (conn.callback.lock().unwrap())(id, ConnectionState::Closing, &empty_params(), &[]);
    });
}

/// Drains every pending connection on a listener's backlog, each accepted
/// socket getting its own `ConnectionId`, fd registration, and `Established`
/// callback. Runs only from the delayed-callback path, since registering
/// the accepted fd needs `&mut EventLoop`.
fn drain_accepts(inner: &Arc<Mutex<Inner>>, handle: &EventLoopHandle, listener_id: ConnectionId, event_loop: &mut EventLoop) {
    loop {
        let accepted = {
            let mut guard = inner.lock().unwrap();
            let Some(conn) = guard.connections.get_mut(&listener_id) else { return };
            let ConnKind::Listener(listener) = &mut conn.kind else { return };
            listener.accept()
        };
        let (mut stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(_) => return,
        };
        let _ = stream.set_nodelay(true);

        let mut guard = inner.lock().unwrap();
        let accepted_id = guard.alloc_id();
        let token = match event_loop.register_fd(
            &mut stream,
            Interest::READABLE,
            make_fd_callback(Arc::clone(inner), handle.clone(), accepted_id),
        ) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // The listener's own callback is reused for every connection it
        // accepts, matching the manager-level one-callback-per-`open`
        // contract; each accepted connection still gets its own id.
        let Some(listener) = guard.connections.get(&listener_id) else {
            let _ = event_loop.deregister_fd(&mut stream, token);
            continue;
        };
        let shared_callback = Arc::clone(&listener.callback);

        guard.connections.insert(
            accepted_id,
            Conn { kind: ConnKind::Active(stream), token, state: ConnectionState::Established, callback: shared_callback },
        );
        guard.lifecycle.fd_opened();

        let mut params = KeyValueMap::new();
        params.insert("remote-address".into(), Variant::String(peer.to_string()));
        let conn = guard.connections.get_mut(&accepted_id).unwrap();
        (conn.callback.lock().unwrap())(accepted_id, ConnectionState::Established, &params, &[]);
    }
}

/// Single `FdCallback` for a connection, active for its whole lifetime.
/// On every readiness event it defers to the delayed-callback path, then
/// branches on the connection's current state: `Opening` means this is the
/// connect-readiness event; `Established` means it's read-readiness.
/// Listener fds use [`drain_accepts`] directly instead.
fn make_fd_callback(inner: Arc<Mutex<Inner>>, handle: EventLoopHandle, id: ConnectionId) -> Box<dyn FnMut(EventMask) + Send> {
    Box::new(move |mask: EventMask| {
        let inner = Arc::clone(&inner);
        let handle_inner = handle.clone();
        handle.schedule(move |event_loop| {
            let was_opening = {
                let guard = inner.lock().unwrap();
                match guard.connections.get(&id) {
                    Some(conn) => conn.state == ConnectionState::Opening,
                    None => return,
                }
            };

            if was_opening {
                let err = {
                    let mut guard = inner.lock().unwrap();
                    let Some(conn) = guard.connections.get_mut(&id) else { return };
                    let ConnKind::Active(stream) = &mut conn.kind else { return };
                    stream.take_error().ok().flatten()
                };
                if err.is_some() || mask.error {
                    schedule_teardown(&inner, &handle_inner, id);
                    return;
                }
                let mut guard = inner.lock().unwrap();
                let Some(conn) = guard.connections.get_mut(&id) else { return };
                let ConnKind::Active(stream) = &mut conn.kind else { return };
                if event_loop.reregister_fd(stream, conn.token, Interest::READABLE).is_err() {
                    drop(guard);
                    schedule_teardown(&inner, &handle_inner, id);
                    return;
                }
                conn.state = ConnectionState::Established;
                (conn.callback.lock().unwrap())(id, ConnectionState::Established, &empty_params(), &[]);
                return;
            }

            if mask.error {
                schedule_teardown(&inner, &handle_inner, id);
                return;
            }

            // One recv per readiness event into the manager's shared rx
            // buffer (§4.4.1) rather than draining until `WouldBlock`: the
            // next edge/level-triggered readiness notification picks up
            // any remainder.
            let recv_bufsize = inner.lock().unwrap().recv_bufsize;
            let mut buf = vec![0u8; recv_bufsize];
            let read_result = {
                let mut guard = inner.lock().unwrap();
                let Some(conn) = guard.connections.get_mut(&id) else { return };
                let ConnKind::Active(stream) = &mut conn.kind else { return };
                stream.read(&mut buf)
            };
            match read_result {
                Ok(0) => schedule_teardown(&inner, &handle_inner, id),
                Ok(n) => {
                    let mut guard = inner.lock().unwrap();
                    let Some(conn) = guard.connections.get_mut(&id) else { return };
                    (conn.callback.lock().unwrap())(id, ConnectionState::Established, &empty_params(), &buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => schedule_teardown(&inner, &handle_inner, id),
            }
        });
    })
}

impl ConnectionManager for TcpConnectionManager {
    fn protocol(&self) -> &'static str {
        "tcp"
    }

    fn state(&self) -> EventSourceState {
        self.inner.lock().unwrap().lifecycle.state()
    }

    fn start(&mut self, _event_loop: &mut EventLoop) -> Result<(), StatusCode> {
        let mut inner = self.inner.lock().unwrap();
        inner.lifecycle.transition_to(EventSourceState::Starting)?;
        inner.lifecycle.transition_to(EventSourceState::Started)
    }

    fn stop(&mut self, event_loop: &mut EventLoop) {
        let handle = event_loop.handle();
        let ids: Vec<ConnectionId> = {
            let mut inner = self.inner.lock().unwrap();
            let _ = inner.lifecycle.transition_to(EventSourceState::Stopping);
            inner.connections.keys().copied().collect()
        };
        for id in ids {
            schedule_teardown(&self.inner, &handle, id);
        }
    }

    fn open(
        &mut self,
        event_loop: &mut EventLoop,
        params: &KeyValueMap,
        callback: ConnectionCallback,
    ) -> Result<ConnectionId, StatusCode> {
        let logger = self.inner.lock().unwrap().logger.clone();
        let status = kvmap::validate(&logger, "tcp", &restrictions(), params);
        if status.is_bad() {
            return Err(status);
        }
        if !self.state().can_open() {
            return Err(StatusCode::BadInternalError);
        }

        let port = get_u16(params, "port").ok_or(StatusCode::BadInvalidArgument)?;
        let address = get_string(params, "address").unwrap_or_else(|| "0.0.0.0".to_owned());
        let listen = get_bool(params, "listen", true);
        let validate_only = get_bool(params, "validate", false);
        let reuse = get_bool(params, "reuse", false);
        if let Some(recv_bufsize) = get_u32(params, "recv-bufsize") {
            self.inner.lock().unwrap().recv_bufsize = recv_bufsize as usize;
        }

        let sock_addr = resolve(&address, port).map_err(StatusCode::from)?;
        let socket = make_socket(&sock_addr, reuse).map_err(StatusCode::from)?;

        if listen {
            socket.bind(&sock_addr.into()).map_err(StatusCode::from)?;
            if validate_only {
                return Ok(ConnectionId(0));
            }
            socket.listen(128).map_err(StatusCode::from)?;
            let mut mio_listener = TcpListener::from_std(socket.into());

            let mut inner = self.inner.lock().unwrap();
            let id = inner.alloc_id();
            let handle = event_loop.handle();
            let inner_arc = Arc::clone(&self.inner);

            let token = event_loop
                .register_fd(
                    &mut mio_listener,
                    Interest::READABLE,
                    Box::new(move |mask: EventMask| {
                        if !mask.readable {
                            return;
                        }
                        let inner_arc = Arc::clone(&inner_arc);
                        let handle = handle.clone();
                        handle.clone().schedule(move |event_loop| {
                            drain_accepts(&inner_arc, &handle, id, event_loop);
                        });
                    }),
                )
                .map_err(StatusCode::from)?;

            inner.connections.insert(
                id,
                Conn { kind: ConnKind::Listener(mio_listener), token, state: ConnectionState::Established, callback: Arc::new(Mutex::new(callback)) },
            );
            inner.lifecycle.fd_opened();

            let mut listen_params = KeyValueMap::new();
            listen_params.insert("listen-address".into(), Variant::String(sock_addr.ip().to_string()));
            listen_params.insert("listen-port".into(), Variant::UInt16(sock_addr.port()));
            let conn = inner.connections.get_mut(&id).unwrap();
            (conn.callback.lock().unwrap())(id, ConnectionState::Established, &listen_params, &[]);
            info!(inner.logger, "tcp listener established"; "address" => %sock_addr);
            Ok(id)
        } else {
            socket.connect(&sock_addr.into()).ok();
            let raw_fd = socket.into_raw_fd();
            let mut stream = unsafe { TcpStream::from_std(std::net::TcpStream::from_raw_fd(raw_fd)) };
            let _ = stream.set_nodelay(true);

            let mut inner = self.inner.lock().unwrap();
            let id = inner.alloc_id();
            let handle = event_loop.handle();
            let inner_arc = Arc::clone(&self.inner);

            let token = event_loop
                .register_fd(&mut stream, Interest::WRITABLE, make_fd_callback(inner_arc, handle, id))
                .map_err(StatusCode::from)?;

            inner.connections.insert(
                id,
                Conn { kind: ConnKind::Active(stream), token, state: ConnectionState::Opening, callback: Arc::new(Mutex::new(callback)) },
            );
            inner.lifecycle.fd_opened();
            let conn = inner.connections.get_mut(&id).unwrap();
            (conn.callback.lock().unwrap())(id, ConnectionState::Opening, &empty_params(), &[]);
            Ok(id)
        }
    }

    fn send(&mut self, connection_id: ConnectionId, _params: &KeyValueMap, buf: NetworkBuffer) -> Result<(), StatusCode> {
        let mut inner = self.inner.lock().unwrap();
        let bound = inner.send_retry_bound;
        let conn = inner.connections.get_mut(&connection_id).ok_or(StatusCode::BadNotFound)?;
        let ConnKind::Active(stream) = &mut conn.kind else {
            return Err(StatusCode::BadInvalidArgument);
        };
        write_all_retrying(stream, buf.as_wire_bytes(), bound)
    }

    fn shutdown(&mut self, event_loop: &mut EventLoop, connection_id: ConnectionId) -> Result<(), StatusCode> {
        if !self.inner.lock().unwrap().connections.contains_key(&connection_id) {
            return Ok(());
        }
        let handle = event_loop.handle();
        schedule_teardown(&self.inner, &handle, connection_id);
        Ok(())
    }

    fn alloc_network_buffer(&self, _connection_id: ConnectionId, size: usize) -> NetworkBuffer {
        NetworkBuffer::new(0, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventloop::EventLoop;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration as StdDuration;

    fn open_params(port: u16, listen: bool) -> KeyValueMap {
        let mut m = KeyValueMap::new();
        m.insert("port".into(), Variant::UInt16(port));
        m.insert("address".into(), Variant::String("127.0.0.1".into()));
        m.insert("listen".into(), Variant::Boolean(listen));
        m
    }

    #[test]
    fn open_rejects_missing_port() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut cm = TcpConnectionManager::new(transport_support::logging::discard());
        cm.start(&mut event_loop).unwrap();
        let mut map = KeyValueMap::new();
        map.insert("address".into(), Variant::String("127.0.0.1".into()));
        let result = cm.open(&mut event_loop, &map, Box::new(|_, _, _, _| {}));
        assert_eq!(result.unwrap_err(), StatusCode::BadInvalidArgument);
    }

    #[test]
    fn fresh_manager_cannot_open() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut cm = TcpConnectionManager::new(transport_support::logging::discard());
        let result = cm.open(&mut event_loop, &open_params(0, true), Box::new(|_, _, _, _| {}));
        assert_eq!(result.unwrap_err(), StatusCode::BadInternalError);
    }

    #[test]
    fn listen_reports_established_synchronously_with_listen_port() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut cm = TcpConnectionManager::new(transport_support::logging::discard());
        cm.start(&mut event_loop).unwrap();

        static LAST_PORT: AtomicU16 = AtomicU16::new(0);
        let listen_id = cm
            .open(
                &mut event_loop,
                &open_params(0, true),
                Box::new(move |_, state, params, _| {
                    if state == ConnectionState::Established {
                        if let Some(Variant::UInt16(p)) = params.get("listen-port") {
                            LAST_PORT.store(*p, Ordering::SeqCst);
                        }
                    }
                }),
            )
            .unwrap();
        assert_ne!(listen_id.0, 0);
        assert_ne!(LAST_PORT.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn accepted_connection_delivers_payload_and_then_closing() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut cm = TcpConnectionManager::new(transport_support::logging::discard());
        cm.start(&mut event_loop).unwrap();

        static LAST_PORT: AtomicU16 = AtomicU16::new(0);
        let established_count = Arc::new(AtomicUsize::new(0));
        let closing_count = Arc::new(AtomicUsize::new(0));
        let payload_bytes = Arc::new(Mutex::new(Vec::new()));

        let established_cb = Arc::clone(&established_count);
        let closing_cb = Arc::clone(&closing_count);
        let payload_cb = Arc::clone(&payload_bytes);

        cm.open(
            &mut event_loop,
            &open_params(0, true),
            Box::new(move |_, state, params, payload| match state {
                ConnectionState::Established => {
                    established_cb.fetch_add(1, Ordering::SeqCst);
                    if let Some(Variant::UInt16(p)) = params.get("listen-port") {
                        LAST_PORT.store(*p, Ordering::SeqCst);
                    }
                    if !payload.is_empty() {
                        payload_cb.lock().unwrap().extend_from_slice(payload);
                    }
                }
                ConnectionState::Closing => {
                    closing_cb.fetch_add(1, Ordering::SeqCst);
                }
                ConnectionState::Opening => {}
            }),
        )
        .unwrap();

        let port = LAST_PORT.load(Ordering::SeqCst);
        assert_ne!(port, 0);

        let client = thread::spawn(move || {
            let mut stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"hello").unwrap();
            thread::sleep(StdDuration::from_millis(100));
            drop(stream);
        });

        for _ in 0..100 {
            event_loop.run_iterate(false);
            thread::sleep(StdDuration::from_millis(10));
            if payload_bytes.lock().unwrap().as_slice() == b"hello" {
                break;
            }
        }
        client.join().unwrap();
        for _ in 0..50 {
            event_loop.run_iterate(false);
            if closing_count.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(StdDuration::from_millis(10));
        }

        assert_eq!(payload_bytes.lock().unwrap().as_slice(), b"hello");
        assert!(established_count.load(Ordering::SeqCst) >= 2); // listener + accepted
    }
}
