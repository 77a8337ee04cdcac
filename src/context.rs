//! The ensemble context: the single struct that owns every subsystem and
//! drives the non-re-entrant poll loop.
//!
//! Earlier designs of this kind of engine keep their state in process
//! globals (the reference implementation does, guarded by the assumption
//! that a process only ever joins one ensemble). Here it is encapsulated in
//! [`Context`] instead, so nothing prevents a single process embedding more
//! than one ensemble if it ever needs to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tracing::{trace, warn};

use crate::address::Address;
use crate::bridge::{Bridge, DeliveryDecision};
use crate::clock::Clock;
use crate::codec::{Message, Packet};
use crate::diagnostics::Diagnostics;
use crate::directory::{Handler, HandlerTree, Offerer, ServiceDirectory};
use crate::discovery::{major_version, DiscoverySink, PROTOCOL_VERSION};
use crate::error::{CoreError, Result};
use crate::process::ProcessName;
use crate::scheduler::Scheduler;
use crate::tap::{TapMode, Tap};
use crate::transport::{SocketHandle, SocketTable, TransportEvent};

/// A known route to a remote process's transport endpoints, built up
/// opportunistically as ensemble- and version-matching peers are
/// discovered. Only the TCP socket is connected eagerly; a UDP peer link
/// is established lazily the first time a best-effort send needs it.
struct PeerLink {
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    tcp: Option<SocketHandle>,
    udp: Option<SocketHandle>,
}

/// Default drop-warning callback: logs through `tracing` rather than
/// printing directly, matching the ambient logging convention.
fn default_drop_warning(address: &str, reason: &str) {
    warn!(address, reason, "message_dropped");
}

/// One running ensemble process: service directory, scheduler, clock,
/// transport, and the pending-send queue that makes handler dispatch safe
/// to re-enter indirectly (a handler's own sends are queued, never applied
/// inline, and drained only after the triggering dispatch returns).
pub struct Context {
    pub self_name: ProcessName,
    ensemble: String,
    directory: ServiceDirectory,
    scheduler: Scheduler,
    clock: Clock,
    transport: SocketTable,
    /// Routes to remote processes currently known to own a service this
    /// process has seen addressed, keyed by process name and built from
    /// ensemble/version-matching `PeerEvent`s as they arrive.
    peer_links: HashMap<ProcessName, PeerLink>,
    bridges: Vec<Box<dyn Bridge>>,
    /// A dedicated current-thread runtime used only to drive the async
    /// `Bridge` trait from this otherwise-synchronous poll loop, the same
    /// way the teacher's `utils::spawn_with_affinity` builds a runtime and
    /// calls `block_on` when it needs to bridge a sync call site into async.
    bridge_rt: Runtime,
    discovery: Vec<Box<dyn DiscoverySink>>,
    pending_sends: Vec<(Address, Message)>,
    /// Bridge sends a `DeliveryDecision::Postpone` asked to be retried on a
    /// later poll, keyed by bridge id rather than replayed through
    /// `ServiceDirectory::dispatch` (which would re-run local handlers and
    /// taps a second time for the same message).
    pending_bridge_sends: Vec<(String, Message)>,
    drop_warning: Option<Box<dyn Fn(&str, &str) + Send>>,
    diagnostics: Diagnostics,
    start: Instant,
}

impl Context {
    pub fn new(self_name: ProcessName, ensemble: impl Into<String>) -> Result<Self> {
        let bridge_rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Context {
            clock: Clock::new(self_name.clone()),
            self_name,
            ensemble: ensemble.into(),
            directory: ServiceDirectory::new(),
            scheduler: Scheduler::new(),
            transport: SocketTable::new()?,
            peer_links: HashMap::new(),
            bridges: Vec::new(),
            bridge_rt,
            discovery: Vec::new(),
            pending_sends: Vec::new(),
            pending_bridge_sends: Vec::new(),
            drop_warning: None,
            diagnostics: Diagnostics::new(),
            start: Instant::now(),
        })
    }

    /// Monotonic local time in seconds since the context started, the
    /// local scheduler's and clock's time base.
    pub fn local_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn global_time(&mut self) -> Option<f64> {
        let local = self.local_time();
        self.clock.global_time(local)
    }

    /// Apply (or ignore) a clock correction decided elsewhere — typically
    /// the outcome of the jump callback set on this process's [`Clock`].
    /// When `adjust` is true, every pending global-scheduler entry is
    /// shifted by the same delta so timed deliveries already queued stay
    /// valid relative to the corrected clock.
    pub fn clock_jump(&mut self, local: f64, global: f64, adjust: bool) {
        if !adjust {
            return;
        }
        let delta = self.clock.apply_jump(local, global);
        self.scheduler.global.shift_all(delta);
    }

    pub fn set_drop_warning(&mut self, cb: Box<dyn Fn(&str, &str) + Send>) {
        self.drop_warning = Some(cb);
    }

    fn warn_dropped(&self, address: &str, reason: &str) {
        match &self.drop_warning {
            Some(cb) => cb(address, reason),
            None => default_drop_warning(address, reason),
        }
    }

    pub fn add_discovery_sink(&mut self, sink: Box<dyn DiscoverySink>) {
        self.discovery.push(sink);
    }

    pub fn add_bridge(&mut self, bridge: Box<dyn Bridge>) {
        self.bridges.push(bridge);
    }

    pub fn offer_service(&mut self, name: &str) -> Result<()> {
        self.directory
            .offer(name, self.self_name.clone(), Offerer::Local(HandlerTree::new()))
    }

    pub fn withdraw_service(&mut self, name: &str) {
        self.directory.withdraw(name);
    }

    pub fn add_handler(&mut self, service: &str, path_segments: &[&str], handler: Handler) -> Result<()> {
        self.directory.add_handler(service, path_segments, handler)
    }

    pub fn tap(&mut self, tappee: &str, tapper: &str, mode: TapMode) -> Result<()> {
        self.directory.tap(Tap::new(tappee, tapper, mode))
    }

    pub fn untap(&mut self, tappee: &str, tapper: &str) {
        self.directory.untap(tappee, tapper)
    }

    pub fn set_property(&mut self, service: &str, key: &str, value: &str) {
        self.directory.set_property(service, key, value)
    }

    pub fn get_property<'a>(&'a self, service: &str, key: &str) -> Option<&'a str> {
        self.directory.get_property(service, key)
    }

    pub fn listen_tcp(&mut self, addr: SocketAddr) -> Result<SocketHandle> {
        self.transport.listen_tcp(addr)
    }

    pub fn bind_udp(&mut self, addr: SocketAddr) -> Result<SocketHandle> {
        self.transport.bind_udp(addr)
    }

    pub fn local_addr(&self, handle: SocketHandle) -> Result<SocketAddr> {
        self.transport.local_addr(handle)
    }

    /// Queue a message for dispatch. Called from outside a handler, this
    /// dispatches on the next `poll()`; called from within a handler, it is
    /// deferred the same way so a handler can never be re-entered.
    pub fn send(&mut self, address: &str, message: Message) -> Result<()> {
        let parsed = Address::parse(address)?;
        self.pending_sends.push((parsed, message));
        Ok(())
    }

    /// Schedule `packet` for delivery once `due` (measured on the
    /// synchronized ensemble clock) has passed. A `due` greater than zero
    /// requires the clock to already be synchronized, matching the wire
    /// contract that a scheduled delivery time is meaningless before this
    /// process has a global time base at all.
    pub fn schedule_global(&mut self, due: f64, packet: Packet) -> Result<()> {
        if !due.is_finite() {
            return Err(CoreError::ScheduleOutOfRange(due as i64));
        }
        if due > 0.0 && self.clock.status() != crate::clock::ClockStatus::Synchronized {
            return Err(CoreError::ClockNotSynchronized);
        }
        self.scheduler.global.schedule(due, packet);
        Ok(())
    }

    /// Schedule `packet` for delivery once `due` (measured on this
    /// process's local, unsynchronized clock) has passed.
    pub fn schedule_local(&mut self, due: f64, packet: Packet) -> Result<()> {
        if !due.is_finite() {
            return Err(CoreError::ScheduleOutOfRange(due as i64));
        }
        self.scheduler.local.schedule(due, packet);
        Ok(())
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// One iteration of the non-re-entrant poll loop:
    /// 1. advance both scheduler wheels and dispatch anything now due,
    /// 2. poll transport sockets and reassemble inbound packets,
    /// 3. drain discovery sinks,
    /// 4. dispatch every message produced by steps 1–3,
    /// 5. drain the pending-send queue accumulated by handlers during
    ///    this iteration (repeating until it runs dry, so a tap chain
    ///    triggered by a scheduled message still resolves in one `poll`).
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<()> {
        let now_local = self.local_time();
        let now_global = self.global_time().unwrap_or(now_local);

        let due: Vec<Packet> = self
            .scheduler
            .global
            .advance(now_global)
            .into_iter()
            .chain(self.scheduler.local.advance(now_local))
            .collect();
        for packet in due {
            self.dispatch_packet(packet);
        }

        for event in self.transport.poll(timeout)? {
            match event {
                TransportEvent::Accepted(handle, addr) => {
                    trace!(?handle, %addr, "tcp_accepted");
                }
                TransportEvent::Message(_handle, bytes) => match Packet::decode(&bytes) {
                    Ok(packet) => self.dispatch_packet(packet),
                    Err(e) => self.warn_dropped("<wire>", &e.to_string()),
                },
                TransportEvent::Closed(handle) => {
                    trace!(?handle, "connection_closed");
                }
            }
        }

        self.diagnostics.record_queue_depth(self.transport.total_outbound_depth());

        let mut accepted_peers = Vec::new();
        for sink in &mut self.discovery {
            accepted_peers.extend(sink.poll_events());
        }
        for event in accepted_peers {
            if event.ensemble_name != self.ensemble {
                trace!(ensemble = event.ensemble_name, process = %event.process, "peer_ensemble_mismatch");
                continue;
            }
            if major_version(event.version_number) != major_version(PROTOCOL_VERSION) {
                trace!(process = %event.process, version = event.version_number, "peer_version_mismatch");
                continue;
            }
            trace!(process = %event.process, kind = ?event.kind, "peer_discovered");
            self.clock.consider_candidate(&event.process);
            self.note_peer_addresses(event.process, event.tcp_port, event.udp_port);
        }

        for i in 0..self.bridges.len() {
            let polled = self.bridge_rt.block_on(self.bridges[i].poll());
            match polled {
                Ok(Some(message)) => self.dispatch_message(&message),
                Ok(None) => {}
                Err(e) => {
                    let id = self.bridges[i].id().to_string();
                    self.warn_dropped(&id, &e.to_string());
                }
            }
        }

        for (id, message) in std::mem::take(&mut self.pending_bridge_sends) {
            self.send_to_bridge(&id, &message);
        }

        self.drain_pending_sends();
        Ok(())
    }

    fn dispatch_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Message(msg) => self.dispatch_message(&msg),
            Packet::Bundle(bundle) => {
                for element in bundle.elements {
                    self.dispatch_packet(element);
                }
            }
        }
    }

    fn dispatch_message(&mut self, message: &Message) {
        let address = match Address::parse(&message.address) {
            Ok(address) => address,
            Err(e) => {
                self.warn_dropped(&message.address, &e.to_string());
                return;
            }
        };
        self.dispatch_resolved(&address, message);
    }

    /// The timed unit of dispatch work: local handler/tap fan-out plus any
    /// bridge or remote-process forwarding, shared by the inbound path and
    /// the pending-send drain so both contribute to the same latency
    /// histogram. Local taps fire regardless of who owns the service, so
    /// the directory dispatch always runs before any forwarding.
    fn dispatch_resolved(&mut self, address: &Address, message: &Message) {
        let started = Instant::now();
        enum Forward {
            Bridge(String),
            Remote(ProcessName),
        }
        let forward = match self.directory.offerer_ref(address.service_name()) {
            Some(Offerer::Bridge(id)) => Some(Forward::Bridge(id.clone())),
            Some(Offerer::Remote(process)) => Some(Forward::Remote(process.clone())),
            _ => None,
        };
        self.directory.dispatch(address, message);
        match forward {
            Some(Forward::Bridge(id)) => self.send_to_bridge(&id, message),
            Some(Forward::Remote(process)) => self.send_to_remote(&process, message),
            None => {}
        }
        self.diagnostics
            .record_dispatch_latency(started.elapsed().as_micros() as u64);
    }

    /// Hand `message` to the embedding bridge named `id`, blocking this poll
    /// iteration on its async `send` the same way inbound `poll()` is driven.
    fn send_to_bridge(&mut self, id: &str, message: &Message) {
        let Some(bridge) = self.bridges.iter_mut().find(|b| b.id() == id) else {
            let err = CoreError::BridgeRejected(id.to_string());
            self.warn_dropped(&message.address, &err.to_string());
            return;
        };
        match self.bridge_rt.block_on(bridge.send(message)) {
            Ok(DeliveryDecision::Complete) => {}
            Ok(DeliveryDecision::Postpone) => {
                self.pending_bridge_sends.push((id.to_string(), message.clone()));
            }
            Err(e) => self.warn_dropped(&message.address, &e.to_string()),
        }
    }

    /// Record (or refresh) a discovered peer's transport endpoints so a
    /// later message addressed to a service it owns can be forwarded.
    fn note_peer_addresses(&mut self, process: ProcessName, tcp_port: u16, udp_port: u16) {
        let ip = std::net::Ipv4Addr::from(process.public_ip);
        let tcp_addr = SocketAddr::new(ip.into(), tcp_port);
        let udp_addr = SocketAddr::new(ip.into(), udp_port);
        self.peer_links
            .entry(process)
            .and_modify(|link| {
                link.tcp_addr = tcp_addr;
                link.udp_addr = udp_addr;
            })
            .or_insert(PeerLink {
                tcp_addr,
                udp_addr,
                tcp: None,
                udp: None,
            });
    }

    fn ensure_peer_tcp(&mut self, process: &ProcessName) -> Option<SocketHandle> {
        let existing = self.peer_links.get(process)?.tcp;
        if let Some(handle) = existing {
            return Some(handle);
        }
        let tcp_addr = self.peer_links.get(process)?.tcp_addr;
        match self.transport.connect_tcp(tcp_addr) {
            Ok(handle) => {
                self.peer_links.get_mut(process).unwrap().tcp = Some(handle);
                Some(handle)
            }
            Err(e) => {
                warn!(process = %process, error = %e, "peer_tcp_connect_failed");
                None
            }
        }
    }

    fn ensure_peer_udp(&mut self, process: &ProcessName) -> Option<SocketHandle> {
        let existing = self.peer_links.get(process)?.udp;
        if let Some(handle) = existing {
            return Some(handle);
        }
        let udp_addr = self.peer_links.get(process)?.udp_addr;
        match self.transport.connect_udp(udp_addr) {
            Ok(handle) => {
                self.peer_links.get_mut(process).unwrap().udp = Some(handle);
                Some(handle)
            }
            Err(e) => {
                warn!(process = %process, error = %e, "peer_udp_connect_failed");
                None
            }
        }
    }

    /// Serialize `message` and enqueue it on the remote-owning process's
    /// TCP or UDP socket, choosing the transport by `message.reliable`.
    /// Connects lazily on first use; drops with a warning if no route to
    /// `process` is known or the connection attempt fails.
    fn send_to_remote(&mut self, process: &ProcessName, message: &Message) {
        let handle = if message.reliable {
            self.ensure_peer_tcp(process)
        } else {
            self.ensure_peer_udp(process)
        };
        let Some(handle) = handle else {
            self.warn_dropped(&message.address, "no route to remote offerer");
            return;
        };
        let frame = Packet::Message(message.clone()).encode();
        if let Err(e) = self.transport.enqueue(handle, frame) {
            self.warn_dropped(&message.address, &e.to_string());
        }
    }

    fn drain_pending_sends(&mut self) {
        while !self.pending_sends.is_empty() {
            let batch = std::mem::take(&mut self.pending_sends);
            for (address, message) in batch {
                self.dispatch_resolved(&address, &message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageBuilder;
    use std::sync::{Arc, Mutex};

    fn process(n: u32) -> ProcessName {
        ProcessName::new(n, n, 1000)
    }

    #[test]
    fn offer_and_dispatch_reaches_registered_handler() {
        let mut ctx = Context::new(process(1), "rehearsal").unwrap();
        ctx.offer_service("echo").unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        ctx.add_handler(
            "echo",
            &["ping"],
            Box::new(move |addr, _msg| calls2.lock().unwrap().push(addr.to_string())),
        )
        .unwrap();
        let msg = MessageBuilder::start("/echo/ping")
            .add_int32(1)
            .finish(0.0, true);
        ctx.send("/echo/ping", msg).unwrap();
        ctx.drain_pending_sends();
        assert_eq!(calls.lock().unwrap().as_slice(), ["/echo/ping"]);
    }

    #[test]
    fn scheduled_message_is_withheld_until_its_due_time() {
        let mut ctx = Context::new(process(1), "rehearsal").unwrap();
        ctx.offer_service("metronome").unwrap();
        let calls = Arc::new(Mutex::new(0));
        let calls2 = calls.clone();
        ctx.add_handler(
            "metronome",
            &["tick"],
            Box::new(move |_addr, _msg| {
                *calls2.lock().unwrap() += 1;
            }),
        )
        .unwrap();
        let msg = MessageBuilder::start("/metronome/tick").finish(0.0, true);
        ctx.schedule_local(10_000.0, Packet::Message(msg)).unwrap();
        ctx.poll(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
