//! TCP/UDP transport: an `mio`-driven socket table with non-blocking
//! outbound queues, matching the single poll-thread concurrency model.
//!
//! Sockets are kept in an arena (`SocketTable`) addressed by a small
//! integer handle rather than by raw file descriptor, the same invariant
//! the reference implementation's parallel `fds`/`fds_info` arrays provide,
//! but without swap-on-remove index invalidation: removal is deferred to
//! the end of the current `poll()` call.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use crate::error::{CoreError, Result};

/// Opaque handle into a [`SocketTable`]; stable across `poll()` calls until
/// the socket is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(usize);

enum Kind {
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    Udp(UdpSocket),
}

struct SocketRecord {
    kind: Kind,
    outbound: VecDeque<Vec<u8>>,
    /// Bytes of the front outbound frame's length-prefixed header already
    /// written to the stream, so a partial write resumes past what was
    /// already sent instead of re-sending the frame from its start (which
    /// would desync the peer's length-prefix reassembly).
    outbound_sent: usize,
    inbound: Vec<u8>,
    closing: bool,
}

/// One readiness event surfaced by [`SocketTable::poll`].
pub enum TransportEvent {
    /// A listener accepted a new TCP connection.
    Accepted(SocketHandle, SocketAddr),
    /// A complete length-prefixed message (TCP) or datagram (UDP) arrived.
    Message(SocketHandle, Vec<u8>),
    /// The peer closed the connection or an unrecoverable I/O error occurred.
    Closed(SocketHandle),
}

const LISTENER_BACKLOG_TOKEN_BASE: usize = 0;

/// The transport layer's socket arena plus its `mio::Poll` reactor.
pub struct SocketTable {
    poll: Poll,
    events: Events,
    sockets: Vec<Option<SocketRecord>>,
    pending_removal: Vec<usize>,
}

impl SocketTable {
    pub fn new() -> Result<Self> {
        Ok(SocketTable {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            sockets: Vec::new(),
            pending_removal: Vec::new(),
        })
    }

    fn insert(&mut self, kind: Kind) -> Result<SocketHandle> {
        let idx = self
            .sockets
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.sockets.len());
        let record = SocketRecord {
            kind,
            outbound: VecDeque::new(),
            outbound_sent: 0,
            inbound: Vec::new(),
            closing: false,
        };
        if idx == self.sockets.len() {
            self.sockets.push(Some(record));
        } else {
            self.sockets[idx] = Some(record);
        }
        let token = Token(LISTENER_BACKLOG_TOKEN_BASE + idx);
        let interest = Interest::READABLE | Interest::WRITABLE;
        match &mut self.sockets[idx].as_mut().unwrap().kind {
            Kind::TcpListener(l) => self.poll.registry().register(l, token, Interest::READABLE)?,
            Kind::TcpStream(s) => self.poll.registry().register(s, token, interest)?,
            Kind::Udp(u) => self.poll.registry().register(u, token, interest)?,
        }
        Ok(SocketHandle(idx))
    }

    /// Bind a TCP listener with `SO_REUSEADDR` set via `socket2` before
    /// handing the raw socket to `mio`, so a restarted process can rebind
    /// the same ensemble port immediately.
    pub fn listen_tcp(&mut self, addr: SocketAddr) -> Result<SocketHandle> {
        let domain = socket2::Domain::for_address(addr);
        let raw = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into()).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => CoreError::NoPort,
            _ => CoreError::from(e),
        })?;
        raw.listen(128)?;
        let listener = TcpListener::from_std(raw.into());
        self.insert(Kind::TcpListener(listener))
    }

    pub fn connect_tcp(&mut self, addr: SocketAddr) -> Result<SocketHandle> {
        let stream = TcpStream::connect(addr).map_err(|_| CoreError::TcpConnectFail(addr))?;
        tune_tcp_stream(&stream);
        self.insert(Kind::TcpStream(stream))
    }

    pub fn bind_udp(&mut self, addr: SocketAddr) -> Result<SocketHandle> {
        let socket = UdpSocket::bind(addr).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => CoreError::NoPort,
            _ => CoreError::from(e),
        })?;
        self.insert(Kind::Udp(socket))
    }

    /// Bind an ephemeral local UDP socket and connect it to `addr`, so the
    /// single-destination `send`/`recv` calls used elsewhere in this module
    /// apply to it the same way they do to a bound listener's peer.
    pub fn connect_udp(&mut self, addr: SocketAddr) -> Result<SocketHandle> {
        let bind_addr = match addr {
            SocketAddr::V4(_) => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0),
            SocketAddr::V6(_) => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket
            .connect(addr)
            .map_err(|e| CoreError::SocketError(format!("udp connect to {addr}: {e}")))?;
        self.insert(Kind::Udp(socket))
    }

    /// The local address a listener or UDP socket is bound to, useful when
    /// the caller bound to port 0 and needs the OS-assigned port back.
    pub fn local_addr(&self, handle: SocketHandle) -> Result<SocketAddr> {
        match self.sockets.get(handle.0).and_then(Option::as_ref) {
            Some(record) => match &record.kind {
                Kind::TcpListener(l) => Ok(l.local_addr()?),
                Kind::TcpStream(s) => Ok(s.local_addr()?),
                Kind::Udp(u) => Ok(u.local_addr()?),
            },
            None => Err(CoreError::ConnectionClosed),
        }
    }

    /// Total number of frames sitting in every socket's outbound queue,
    /// sampled by the context each poll iteration for queue-depth diagnostics.
    pub fn total_outbound_depth(&self) -> u64 {
        self.sockets
            .iter()
            .flatten()
            .map(|r| r.outbound.len() as u64)
            .sum()
    }

    /// Queue a message for non-blocking delivery; the bytes are sent on a
    /// subsequent `poll()` once the socket reports writable, or immediately
    /// if `send(handle, true)` is called.
    pub fn enqueue(&mut self, handle: SocketHandle, frame: Vec<u8>) -> Result<()> {
        let record = self.record_mut(handle)?;
        record.outbound.push_back(frame);
        Ok(())
    }

    /// Attempt to drain a socket's outbound queue. If `block` is true and
    /// the socket is not yet writable, this performs a blocking write;
    /// otherwise returns [`CoreError::Blocked`] without writing anything.
    pub fn send(&mut self, handle: SocketHandle, block: bool) -> Result<()> {
        let record = self.record_mut(handle)?;
        while let Some(frame) = record.outbound.front() {
            let result = match &mut record.kind {
                Kind::TcpStream(s) => s.write_all(&frame_with_length_prefix(frame)).map_err(CoreError::from),
                Kind::Udp(u) => u.send(frame).map(|_| ()).map_err(CoreError::from),
                Kind::TcpListener(_) => return Err(CoreError::ConnectionClosed),
            };
            match result {
                Ok(()) => {
                    record.outbound.pop_front();
                }
                Err(CoreError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    if block {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    return Err(CoreError::Blocked);
                }
                Err(CoreError::Io(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    return Err(CoreError::TcpHup);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn close(&mut self, handle: SocketHandle) {
        if let Some(Some(record)) = self.sockets.get_mut(handle.0) {
            record.closing = true;
        }
        self.pending_removal.push(handle.0);
    }

    fn record_mut(&mut self, handle: SocketHandle) -> Result<&mut SocketRecord> {
        self.sockets
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(CoreError::ConnectionClosed)
    }

    /// Poll for readiness, service every ready socket, and return the
    /// events observed. Deletions queued via `close()` or discovered during
    /// this call are applied after every event has been produced.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<TransportEvent>> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut out = Vec::new();
        let ready: Vec<usize> = self.events.iter().map(|e| e.token().0).collect();
        for idx in ready {
            self.service_socket(idx, &mut out);
        }
        self.apply_pending_removals();
        Ok(out)
    }

    fn service_socket(&mut self, idx: usize, out: &mut Vec<TransportEvent>) {
        let handle = SocketHandle(idx);
        let Some(Some(record)) = self.sockets.get_mut(idx) else {
            return;
        };
        // Accepted connections are collected here rather than inserted
        // immediately: inserting needs `&mut self`, which would overlap
        // with the `&mut self.sockets[idx]` borrow this listener match is
        // still holding.
        let mut accepted = Vec::new();
        match &mut record.kind {
            Kind::TcpListener(listener) => loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        tune_tcp_stream(&stream);
                        accepted.push((stream, addr));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(error = %e, "accept_failed");
                        break;
                    }
                }
            },
            Kind::TcpStream(stream) => {
                if !drain_reassembly(stream, &mut record.inbound, handle, out) {
                    self.pending_removal.push(idx);
                }
                if !record.outbound.is_empty() {
                    let _ = flush_outbound(stream, &mut record.outbound, &mut record.outbound_sent);
                }
            }
            Kind::Udp(socket) => {
                let mut buf = [0u8; 65536];
                loop {
                    match socket.recv(&mut buf) {
                        Ok(n) => out.push(TransportEvent::Message(handle, buf[..n].to_vec())),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => break,
                    }
                }
                if !record.outbound.is_empty() {
                    while let Some(frame) = record.outbound.front() {
                        match socket.send(frame) {
                            Ok(_) => {
                                record.outbound.pop_front();
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(_) => break,
                        }
                    }
                }
            }
        }
        for (stream, addr) in accepted {
            if let Ok(child) = self.insert_raw_stream(stream) {
                out.push(TransportEvent::Accepted(child, addr));
            }
        }
    }

    fn insert_raw_stream(&mut self, stream: TcpStream) -> Result<SocketHandle> {
        self.insert(Kind::TcpStream(stream))
    }

    fn apply_pending_removals(&mut self) {
        for idx in self.pending_removal.drain(..) {
            if let Some(Some(record)) = self.sockets.get_mut(idx) {
                let _ = match &mut record.kind {
                    Kind::TcpListener(l) => self.poll.registry().deregister(l),
                    Kind::TcpStream(s) => self.poll.registry().deregister(s),
                    Kind::Udp(u) => self.poll.registry().deregister(u),
                };
            }
            self.sockets[idx] = None;
            trace!(handle = idx, "socket_removed");
        }
    }
}

fn tune_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}

fn frame_with_length_prefix(frame: &[u8]) -> Vec<u8> {
    let mut header = Vec::with_capacity(4 + frame.len());
    header.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    header.extend_from_slice(frame);
    header
}

/// Read and reassemble 4-byte big-endian length-prefixed frames from a TCP
/// stream into complete `Message`-sized buffers. Returns `false` if the
/// connection closed or errored unrecoverably.
fn drain_reassembly(
    stream: &mut TcpStream,
    inbound: &mut Vec<u8>,
    handle: SocketHandle,
    out: &mut Vec<TransportEvent>,
) -> bool {
    let mut chunk = [0u8; 65536];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return false,
            Ok(n) => inbound.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => return false,
        }
    }
    loop {
        if inbound.len() < 4 {
            break;
        }
        let len = u32::from_be_bytes(inbound[..4].try_into().unwrap()) as usize;
        if inbound.len() < 4 + len {
            break;
        }
        let frame = inbound[4..4 + len].to_vec();
        inbound.drain(..4 + len);
        out.push(TransportEvent::Message(handle, frame));
    }
    true
}

/// Write as much of the front outbound frame as the socket currently
/// accepts, resuming from `sent` on a previous partial write rather than
/// re-writing the frame's header and already-sent payload bytes a second
/// time, which would corrupt the peer's length-prefix framing.
fn flush_outbound(
    stream: &mut TcpStream,
    outbound: &mut VecDeque<Vec<u8>>,
    sent: &mut usize,
) -> io::Result<()> {
    while let Some(frame) = outbound.front() {
        let header = frame_with_length_prefix(frame);
        match stream.write(&header[*sent..]) {
            Ok(0) => break,
            Ok(n) => {
                *sent += n;
                if *sent == header.len() {
                    *sent = 0;
                    outbound.pop_front();
                } else {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!(error = %e, "outbound_write_failed");
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn listen_and_close_cycles_a_table_slot() {
        let mut table = SocketTable::new().unwrap();
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
        let handle = table.listen_tcp(addr).unwrap();
        table.close(handle);
        table.apply_pending_removals();
        assert!(table.sockets[handle.0].is_none());
    }

    #[test]
    fn enqueue_on_closed_handle_errors() {
        let mut table = SocketTable::new().unwrap();
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
        let handle = table.listen_tcp(addr).unwrap();
        table.close(handle);
        table.apply_pending_removals();
        assert!(table.enqueue(handle, vec![1, 2, 3]).is_err());
    }
}
