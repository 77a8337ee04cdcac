//! Service directory: offers, the handler tree, pattern dispatch, and taps.

use std::collections::HashMap;

use tracing::{trace, warn};

use crate::address::{glob_match, segments, Address};
use crate::codec::Message;
use crate::error::{CoreError, Result};
use crate::process::ProcessName;
use crate::tap::{TapMode, Tap};

/// A callback invoked with a fully resolved message that the local handler
/// tree matched. Takes the matched address and the message.
pub type Handler = Box<dyn FnMut(&str, &Message) + Send>;

/// Who currently provides a service.
pub enum Offerer {
    /// Handled locally by this process via the handler tree below.
    Local(HandlerTree),
    /// Routed to a remote process reachable over the transport layer.
    Remote(ProcessName),
    /// Routed through an embedding bridge plug-in, named by its bridge id.
    Bridge(String),
}

impl std::fmt::Debug for Offerer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Offerer::Local(_) => write!(f, "Offerer::Local"),
            Offerer::Remote(p) => write!(f, "Offerer::Remote({p})"),
            Offerer::Bridge(id) => write!(f, "Offerer::Bridge({id})"),
        }
    }
}

/// One registered provider for a service name, ranked by process priority.
pub struct ServiceEntry {
    pub owner: ProcessName,
    pub offerer: Offerer,
}

/// A node in a service's address tree: either a leaf handler or a branch
/// to further path segments. Sum-typed rather than tag-dispatched.
pub enum HandlerNode {
    Handler(Handler),
    Branch(HashMap<String, HandlerNode>),
}

/// The per-service hash tree of handler leaves, plus a flat full-path index
/// used by the `!`-prefixed literal fast path.
#[derive(Default)]
pub struct HandlerTree {
    root: HashMap<String, HandlerNode>,
    flat: HashMap<String, ()>,
}

impl HandlerTree {
    pub fn new() -> Self {
        HandlerTree::default()
    }

    /// Register a handler at an exact full path (segments past the service
    /// name), creating intermediate branches as needed.
    pub fn add_handler(&mut self, path_segments: &[&str], handler: Handler) {
        if path_segments.is_empty() {
            return;
        }
        self.flat.insert(path_segments.join("/"), ());
        let mut node = &mut self.root;
        for (i, seg) in path_segments.iter().enumerate() {
            let last = i == path_segments.len() - 1;
            if last {
                node.insert(seg.to_string(), HandlerNode::Handler(handler));
                return;
            }
            let entry = node
                .entry(seg.to_string())
                .or_insert_with(|| HandlerNode::Branch(HashMap::new()));
            match entry {
                HandlerNode::Branch(children) => node = children,
                HandlerNode::Handler(_) => {
                    *entry = HandlerNode::Branch(HashMap::new());
                    if let HandlerNode::Branch(children) = entry {
                        node = children;
                    }
                }
            }
        }
    }

    /// Walk an exact path to its handler, no pattern matching, for the
    /// literal `!` fast path.
    fn find_exact<'a>(&'a mut self, path_segments: &[&str]) -> Option<&'a mut Handler> {
        if !self.flat.contains_key(&path_segments.join("/")) {
            return None;
        }
        let mut node = &mut self.root;
        for (i, seg) in path_segments.iter().enumerate() {
            let last = i == path_segments.len() - 1;
            match node.get_mut(*seg) {
                Some(HandlerNode::Handler(h)) if last => return Some(h),
                Some(HandlerNode::Branch(children)) if !last => node = children,
                _ => return None,
            }
        }
        None
    }

    /// Collect every handler whose registered path matches `path_segments`
    /// under OSC glob rules, one segment at a time.
    fn find_matching<'a>(&'a mut self, path_segments: &[&str]) -> Vec<&'a mut Handler> {
        let mut out = Vec::new();
        collect_matches(&mut self.root, path_segments, &mut out);
        out
    }
}

fn collect_matches<'a>(
    level: &'a mut HashMap<String, HandlerNode>,
    remaining: &[&str],
    out: &mut Vec<&'a mut Handler>,
) {
    let Some((seg, rest)) = remaining.split_first() else {
        return;
    };
    for (key, node) in level.iter_mut() {
        if !glob_match(seg, key) {
            continue;
        }
        match node {
            HandlerNode::Handler(h) if rest.is_empty() => out.push(h),
            HandlerNode::Branch(children) if !rest.is_empty() => {
                collect_matches(children, rest, out)
            }
            _ => {}
        }
    }
}

/// A process-global property value attached to a service (arbitrary text,
/// escaped on the wire the way spec.md §3 describes).
#[derive(Debug, Clone, Default)]
pub struct Properties(HashMap<String, String>);

impl Properties {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }
}

/// The full set of services known to this process, plus standing taps.
#[derive(Default)]
pub struct ServiceDirectory {
    services: HashMap<String, ServiceEntry>,
    properties: HashMap<String, Properties>,
    taps: Vec<Tap>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        ServiceDirectory::default()
    }

    /// Offer `name` as a service owned by `owner`. Rejects the offer if a
    /// higher-priority process already owns the name.
    pub fn offer(&mut self, name: &str, owner: ProcessName, offerer: Offerer) -> Result<()> {
        if let Some(existing) = self.services.get(name) {
            if existing.owner.outranks(&owner) {
                return Err(CoreError::ServiceConflict(name.to_string()));
            }
        }
        self.services.insert(name.to_string(), ServiceEntry { owner, offerer });
        Ok(())
    }

    pub fn withdraw(&mut self, name: &str) {
        self.services.remove(name);
        self.properties.remove(name);
    }

    pub fn add_handler(&mut self, service: &str, path_segments: &[&str], handler: Handler) -> Result<()> {
        match self.services.get_mut(service) {
            Some(ServiceEntry {
                offerer: Offerer::Local(tree),
                ..
            }) => {
                tree.add_handler(path_segments, handler);
                Ok(())
            }
            _ => Err(CoreError::NoService(service.to_string())),
        }
    }

    pub fn tap(&mut self, tap: Tap) -> Result<()> {
        if self.taps.contains(&tap) {
            return Err(CoreError::DuplicateTap {
                tappee: tap.tappee,
                tapper: tap.tapper,
            });
        }
        self.taps.push(tap);
        Ok(())
    }

    pub fn untap(&mut self, tappee: &str, tapper: &str) {
        self.taps.retain(|t| !(t.tappee == tappee && t.tapper == tapper));
    }

    pub fn set_property(&mut self, service: &str, key: &str, value: &str) {
        self.properties.entry(service.to_string()).or_default().set(key, value);
    }

    pub fn get_property<'a>(&'a self, service: &str, key: &str) -> Option<&'a str> {
        self.properties.get(service).and_then(|p| p.get(key))
    }

    /// The offerer currently behind `service`, if any is registered at all
    /// (local, remote, or bridge) — used by the context to decide whether a
    /// message destined for a non-local offerer needs forwarding.
    pub fn offerer_ref(&self, service: &str) -> Option<&Offerer> {
        self.services.get(service).map(|e| &e.offerer)
    }

    /// Dispatch one message to every matching local handler, following
    /// address resolution order: literal fast path first when requested,
    /// otherwise full glob matching; then fan out to any standing taps
    /// whose tap-time-to-live budget (`message.ttl`) has not been exhausted.
    pub fn dispatch(&mut self, address: &Address, message: &Message) {
        let service = address.service_name();
        let path = &address.full_path()[1..];
        let rest = match path.find('/') {
            Some(i) => &path[i + 1..],
            None => "",
        };
        let rest_segments = segments(rest);
        let rest_segments: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest_segments };

        let mut matched = false;
        if let Some(ServiceEntry {
            offerer: Offerer::Local(tree),
            ..
        }) = self.services.get_mut(service)
        {
            let handlers: Vec<&mut Handler> = match address {
                Address::Literal(_) => tree.find_exact(&rest_segments).into_iter().collect(),
                Address::Pattern(_) => tree.find_matching(&rest_segments),
            };
            for handler in handlers {
                handler(address.full_path(), message);
                matched = true;
            }
        }

        if !matched && !self.services.contains_key(service) {
            warn!(address = address.full_path(), "no_service");
        }

        if message.ttl >= crate::tap::MAX_TAP_TTL {
            return;
        }
        let forwards: Vec<String> = self
            .taps
            .iter()
            .filter(|t| t.tappee == service)
            .map(|t| {
                let forwarded = t.rewrite_address(address.full_path());
                trace!(from = address.full_path(), to = forwarded, mode = ?t.mode, "tap_forward");
                forwarded
            })
            .collect();
        for forwarded_addr in forwards {
            if let Ok(forwarded) = Address::parse(&forwarded_addr) {
                let mut copy = message.clone();
                copy.address = forwarded_addr.clone();
                copy.ttl += 1;
                self.dispatch(&forwarded, &copy);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn local_owner() -> ProcessName {
        ProcessName::new(1, 1, 1000)
    }

    #[test]
    fn offer_rejects_lower_priority_conflict() {
        let mut dir = ServiceDirectory::new();
        let high = ProcessName::new(9, 9, 9);
        let low = ProcessName::new(1, 1, 1);
        dir.offer("synth", high.clone(), Offerer::Local(HandlerTree::new()))
            .unwrap();
        let err = dir.offer("synth", low, Offerer::Local(HandlerTree::new()));
        assert!(err.is_err());
    }

    #[test]
    fn dispatch_calls_exact_literal_handler() {
        let mut dir = ServiceDirectory::new();
        dir.offer("synth", local_owner(), Offerer::Local(HandlerTree::new()))
            .unwrap();
        let calls = Arc::new(Mutex::new(0));
        let calls2 = calls.clone();
        dir.add_handler(
            "synth",
            &["1", "freq"],
            Box::new(move |_addr, _msg| {
                *calls2.lock().unwrap() += 1;
            }),
        )
        .unwrap();
        let msg = Message {
            address: "/synth/1/freq".into(),
            args: vec![],
            ttl: 0,
            reliable: true,
            timestamp: 0.0,
        };
        let addr = Address::parse("!/synth/1/freq").unwrap();
        dir.dispatch(&addr, &msg);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn dispatch_matches_glob_pattern_handler() {
        let mut dir = ServiceDirectory::new();
        dir.offer("synth", local_owner(), Offerer::Local(HandlerTree::new()))
            .unwrap();
        let calls = Arc::new(Mutex::new(0));
        let calls2 = calls.clone();
        dir.add_handler(
            "synth",
            &["*", "freq"],
            Box::new(move |_addr, _msg| {
                *calls2.lock().unwrap() += 1;
            }),
        )
        .unwrap();
        let msg = Message {
            address: "/synth/7/freq".into(),
            args: vec![],
            ttl: 0,
            reliable: true,
            timestamp: 0.0,
        };
        let addr = Address::parse("/synth/7/freq").unwrap();
        dir.dispatch(&addr, &msg);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn tap_forwards_message_with_rewritten_address() {
        let mut dir = ServiceDirectory::new();
        dir.offer("synth", local_owner(), Offerer::Local(HandlerTree::new()))
            .unwrap();
        dir.offer("logger", local_owner(), Offerer::Local(HandlerTree::new()))
            .unwrap();
        let log_calls = Arc::new(Mutex::new(Vec::new()));
        let log_calls2 = log_calls.clone();
        dir.add_handler(
            "logger",
            &["1", "freq"],
            Box::new(move |addr, _msg| log_calls2.lock().unwrap().push(addr.to_string())),
        )
        .unwrap();
        dir.tap(Tap::new("synth", "logger", TapMode::Keep)).unwrap();
        let msg = Message {
            address: "/synth/1/freq".into(),
            args: vec![],
            ttl: 0,
            reliable: true,
            timestamp: 0.0,
        };
        let addr = Address::parse("/synth/1/freq").unwrap();
        dir.dispatch(&addr, &msg);
        assert_eq!(log_calls.lock().unwrap().as_slice(), ["/logger/1/freq"]);
    }

    #[test]
    fn tap_loop_guard_stops_after_max_ttl() {
        let mut dir = ServiceDirectory::new();
        dir.offer("a", local_owner(), Offerer::Local(HandlerTree::new())).unwrap();
        dir.offer("b", local_owner(), Offerer::Local(HandlerTree::new())).unwrap();
        dir.tap(Tap::new("a", "b", TapMode::Keep)).unwrap();
        dir.tap(Tap::new("b", "a", TapMode::Keep)).unwrap();
        let msg = Message {
            address: "/a/x".into(),
            args: vec![],
            ttl: 0,
            reliable: true,
            timestamp: 0.0,
        };
        let addr = Address::parse("/a/x").unwrap();
        // Must terminate despite the a->b->a->b cycle.
        dir.dispatch(&addr, &msg);
    }
}
