//! Chord-style ring maintenance: each node holds a random 32-bit id on the
//! mod-2³² ring, a successor pointer it stabilizes against its successor's
//! predecessor, a predecessor adopted through notify, and a 32-entry finger
//! table refreshed round-robin, one finger per stabilization tick.

use crate::document::Value;
use crate::network::{kind, Handler, Message, Network, NodeId};
use crate::util::responsive_sleep;

use log::{debug, info};
use rand::Rng as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Interval between stabilization passes.
const STABILIZE_INTERVAL: Duration = Duration::from_millis(500);
/// Response timeout for ring lookups. Stabilization is periodic, so a
/// stuck lookup must not stall it anywhere near a full message expiry.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);
/// The number of finger table entries, covering the full u32 ring.
const FINGERS: usize = 32;

/// Strict circular containment on the u32 ring, endpoints excluded: when
/// min < max this is plain min < num < max, otherwise the interval wraps
/// around zero.
pub fn between(num: u32, min: u32, max: u32) -> bool {
    if min < max {
        min < num && num < max
    } else {
        num > min || num < max
    }
}

/// A node's position on the ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChordNode {
    pub node: NodeId,
    pub id: u32,
}

impl std::fmt::Display for ChordNode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.node, self.id)
    }
}

/// The ring pointers, under the chord module's single readers-writer lock.
/// The successor is nominally entry 0 of the finger table; it is held as
/// its own field so it is structurally never empty, falling back to the
/// node itself on a single-node ring. Entries 1..=31 are the remaining
/// fingers; slot 0 of the table is unused.
pub struct RingState {
    successor: ChordNode,
    fingers: Vec<Option<ChordNode>>,
    predecessor: Option<ChordNode>,
    /// The finger refreshed by the next stabilization pass, in [1, 31].
    next_finger: usize,
}

impl RingState {
    fn new(own: ChordNode) -> Self {
        Self {
            successor: own,
            fingers: vec![None; FINGERS],
            predecessor: None,
            next_finger: 0,
        }
    }

    fn successor(&self) -> &ChordNode {
        &self.successor
    }

    fn set_successor(&mut self, node: ChordNode) {
        self.successor = node;
    }

    /// Scans the finger table highest-first for the closest node strictly
    /// preceding the target, falling back to the successor.
    fn closest_preceding(&self, own_id: u32, target: u32) -> ChordNode {
        for finger in self.fingers[1..].iter().rev().flatten() {
            if between(finger.id, own_id, target) {
                return finger.clone();
            }
        }
        self.successor.clone()
    }

    /// Whether a notify from the candidate should make it our predecessor:
    /// we have none, or it sits strictly between the current predecessor
    /// and ourself on the ring.
    fn should_adopt_predecessor(&self, own_id: u32, candidate: &ChordNode) -> bool {
        match &self.predecessor {
            None => true,
            Some(predecessor) => between(candidate.id, predecessor.id, own_id),
        }
    }

    /// Advances the round-robin finger cursor, wrapping from 31 back to 1.
    fn advance_finger(&mut self) -> usize {
        self.next_finger += 1;
        if self.next_finger >= FINGERS {
            self.next_finger = 1;
        }
        self.next_finger
    }

    /// Drops every pointer referring to a lost peer: the predecessor is
    /// cleared, the successor falls back to the own node, fingers are
    /// emptied.
    fn forget(&mut self, own: &ChordNode, peer: &NodeId) {
        if self.predecessor.as_ref().is_some_and(|p| p.node == *peer) {
            self.predecessor = None;
        }
        if self.successor.node == *peer {
            self.successor = own.clone();
        }
        for finger in self.fingers[1..].iter_mut() {
            if finger.as_ref().is_some_and(|f| f.node == *peer) {
                *finger = None;
            }
        }
    }
}

/// The chord module: maintains this node's ring pointers over the network.
pub struct Chord {
    network: Arc<Network>,
    /// This node's ring position, with a uniform-random id.
    own: ChordNode,
    state: RwLock<RingState>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Chord {
    /// Creates a chord node with a random ring id and registers it with
    /// the network.
    pub fn new(network: Arc<Network>) -> Arc<Self> {
        Self::with_id(network, rand::thread_rng().gen())
    }

    /// Creates a chord node with a fixed ring id.
    pub fn with_id(network: Arc<Network>, id: u32) -> Arc<Self> {
        let own = ChordNode { node: network.name().clone(), id };
        info!("Chord node {own} starting");
        let chord = Arc::new(Self {
            network: network.clone(),
            own: own.clone(),
            state: RwLock::new(RingState::new(own)),
            running: Arc::new(AtomicBool::new(true)),
            thread: Mutex::new(None),
        });
        let handler: Arc<dyn Handler> = chord.clone();
        network.register(Arc::downgrade(&handler));
        chord
    }

    /// Joins the ring through the given seed peers: connects to each and
    /// asks for its successor; the first answer becomes ours. Without a
    /// reachable seed the node remains a single-node ring.
    pub fn join(&self, seeds: &[NodeId]) {
        for seed in seeds {
            if seed == &self.own.node || !self.network.connect(seed.clone()) {
                continue;
            }
            let request =
                Message::request(seed.clone(), kind::CHORD_SUCCESSOR_REQUEST, Value::empty());
            let Some(response) = self.network.call(request, LOOKUP_TIMEOUT) else { continue };
            let Some(successor) = decode_node(&response.payload, "Successor") else { continue };

            if successor != self.own && !self.ensure_connected(&successor.node) {
                debug!("Can't reach successor {successor}, staying alone");
                continue;
            }
            info!("Joined ring through {seed} with successor {successor}");
            self.state.write().expect("lock poisoned").set_successor(successor);
            return;
        }
    }

    /// Starts the stabilization loop.
    pub fn serve(self: &Arc<Self>) {
        let chord = self.clone();
        let handle = std::thread::spawn(move || {
            while responsive_sleep(&chord.running, STABILIZE_INTERVAL) {
                chord.stabilize();
                chord.fix_next_finger();
            }
        });
        *self.thread.lock().expect("lock poisoned") = Some(handle);
    }

    /// Stops the stabilization loop.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().expect("lock poisoned").take() {
            if handle.join().is_err() {
                log::error!("Chord thread panicked during shutdown");
            }
        }
    }

    /// This node's ring position.
    pub fn own(&self) -> &ChordNode {
        &self.own
    }

    /// The current successor.
    pub fn successor(&self) -> ChordNode {
        self.state.read().expect("lock poisoned").successor().clone()
    }

    /// The current predecessor, if any.
    pub fn predecessor(&self) -> Option<ChordNode> {
        self.state.read().expect("lock poisoned").predecessor.clone()
    }

    /// One stabilization pass: probe the successor's predecessor, adopt it
    /// if it sits between us and the successor, then notify the successor
    /// of our existence.
    fn stabilize(&self) {
        let successor = self.successor();
        // The successor's predecessor is the candidate for a closer
        // successor. On a single-node ring the successor is this node, so
        // its predecessor is local state; otherwise it is requested.
        let candidate = if successor == self.own {
            self.predecessor()
        } else {
            let request = Message::request(
                successor.node.clone(),
                kind::CHORD_PREDECESSOR_REQUEST,
                Value::empty(),
            );
            self.network
                .call(request, LOOKUP_TIMEOUT)
                .and_then(|response| decode_node(&response.payload, "Predecessor"))
        };
        if let Some(candidate) = candidate {
            if !candidate.node.host().is_empty()
                && between(candidate.id, self.own.id, successor.id)
            {
                if self.ensure_connected(&candidate.node) {
                    debug!("Adopting closer successor {candidate}");
                    self.state.write().expect("lock poisoned").set_successor(candidate);
                } else {
                    self.state.write().expect("lock poisoned").set_successor(self.own.clone());
                }
            }
        }

        let successor = self.successor();
        if successor != self.own {
            let payload = Value::document([
                ("Node", Value::from(self.own.node.name())),
                ("ChordId", Value::from(self.own.id)),
            ]);
            self.network.send(Message::event(successor.node, kind::CHORD_NOTIFY, payload));
        }
    }

    /// Refreshes the next finger: the nominal owner of own_id + 2^(i-1).
    fn fix_next_finger(&self) {
        let index = self.state.write().expect("lock poisoned").advance_finger();
        let target = self.own.id.wrapping_add(1 << (index - 1));
        let entry = match self.find_successor(target) {
            Some(node) if self.ensure_connected(&node.node) => Some(node),
            _ => None,
        };
        self.state.write().expect("lock poisoned").fingers[index] = entry;
    }

    /// Resolves the successor of a ring id: answered locally when the id
    /// falls between us and our successor, otherwise forwarded to the
    /// closest preceding node from the finger table.
    pub fn find_successor(&self, target: u32) -> Option<ChordNode> {
        let (successor, via) = {
            let state = self.state.read().expect("lock poisoned");
            let successor = state.successor().clone();
            if between(target, self.own.id, successor.id) || target == successor.id {
                return Some(successor);
            }
            let via = state.closest_preceding(self.own.id, target);
            (successor, via)
        };
        if via.node == self.own.node {
            return Some(successor);
        }

        let request = Message::request(via.node, kind::CHORD_SUCCESSOR_REQUEST, Value::empty());
        let response = self.network.call(request, LOOKUP_TIMEOUT)?;
        decode_node(&response.payload, "Successor")
    }

    /// Makes sure we hold a connection to the node, dialing it if needed.
    fn ensure_connected(&self, node: &NodeId) -> bool {
        node == &self.own.node || self.network.connect(node.clone())
    }
}

impl Handler for Chord {
    fn message(&self, message: &Message) -> bool {
        match message.kind.as_str() {
            kind::CHORD_SUCCESSOR_REQUEST => {
                let successor = self.successor();
                let payload = Value::document([
                    ("Successor", Value::from(successor.node.name())),
                    ("ChordId", Value::from(successor.id)),
                ]);
                self.network.send(Message::respond(
                    message,
                    kind::CHORD_SUCCESSOR_RESPONSE,
                    payload,
                ));
                true
            }

            kind::CHORD_PREDECESSOR_REQUEST => {
                // A missing predecessor is reported as the ":0" sentinel.
                let (name, id) = match self.predecessor() {
                    Some(predecessor) => (predecessor.node.name(), predecessor.id),
                    None => (":0".to_owned(), 0),
                };
                let payload = Value::document([
                    ("Predecessor", Value::from(name)),
                    ("ChordId", Value::from(id)),
                ]);
                self.network.send(Message::respond(
                    message,
                    kind::CHORD_PREDECESSOR_RESPONSE,
                    payload,
                ));
                true
            }

            kind::CHORD_NOTIFY => {
                let Some(candidate) = decode_node(&message.payload, "Node") else { return true };
                let adopt = {
                    let state = self.state.read().expect("lock poisoned");
                    state.should_adopt_predecessor(self.own.id, &candidate)
                };
                if adopt {
                    debug!("Adopting predecessor {candidate}");
                    self.state.write().expect("lock poisoned").predecessor =
                        Some(candidate.clone());
                    if !self.ensure_connected(&candidate.node) {
                        let mut state = self.state.write().expect("lock poisoned");
                        if state.predecessor.as_ref() == Some(&candidate) {
                            state.predecessor = None;
                        }
                    }
                }
                true
            }

            _ => false,
        }
    }

    fn disconnected(&self, peer: &NodeId) {
        self.state.write().expect("lock poisoned").forget(&self.own, peer);
    }
}

/// Decodes a (name, ChordId) pair from a payload, under the given name
/// field. Returns None if either field is missing or malformed.
fn decode_node(payload: &Value, name_field: &str) -> Option<ChordNode> {
    let node = payload.get_str(name_field)?.parse().ok()?;
    let id = u32::try_from(payload.get_i64("ChordId")?).ok()?;
    Some(ChordNode { node, id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn between_plain_interval() {
        assert!(between(5, 1, 10));
        assert!(!between(1, 1, 10));
        assert!(!between(10, 1, 10));
        assert!(!between(0, 1, 10));
        assert!(!between(11, 1, 10));
    }

    #[test]
    fn between_wrapping_interval() {
        // The interval (4_000_000_000, 10) wraps through zero.
        assert!(between(4_000_000_100, 4_000_000_000, 10));
        assert!(between(5, 4_000_000_000, 10));
        assert!(between(0, 4_000_000_000, 10));
        assert!(!between(4_000_000_000, 4_000_000_000, 10));
        assert!(!between(10, 4_000_000_000, 10));
        assert!(!between(100, 4_000_000_000, 10));
    }

    #[test]
    fn between_degenerate_interval() {
        // min == max excludes only the endpoint itself.
        assert!(between(5, 7, 7));
        assert!(between(8, 7, 7));
        assert!(!between(7, 7, 7));
    }

    fn node(name: &str, id: u32) -> ChordNode {
        ChordNode { node: NodeId::new(name, 1), id }
    }

    #[test]
    fn closest_preceding_scans_high_fingers_first() {
        let own = node("self", 100);
        let mut state = RingState::new(own);
        state.set_successor(node("succ", 200));
        state.fingers[1] = Some(node("a", 150));
        state.fingers[5] = Some(node("b", 400));
        state.fingers[9] = Some(node("c", 900));

        // Highest finger preceding 1000 wins.
        assert_eq!(state.closest_preceding(100, 1000), node("c", 900));
        // For a target at 500, finger 9 is past it; finger 5 precedes.
        assert_eq!(state.closest_preceding(100, 500), node("b", 400));
        // Nothing precedes 120; fall back to the successor.
        assert_eq!(state.closest_preceding(100, 120), node("succ", 200));
    }

    #[test]
    fn notify_adoption() {
        let own = node("self", 1000);
        let mut state = RingState::new(own);
        // No predecessor: adopt anyone.
        assert!(state.should_adopt_predecessor(1000, &node("a", 500)));
        state.predecessor = Some(node("a", 500));
        // Strictly between the predecessor and us: adopt.
        assert!(state.should_adopt_predecessor(1000, &node("b", 700)));
        // Outside: keep the current predecessor.
        assert!(!state.should_adopt_predecessor(1000, &node("c", 400)));
        // Endpoints are excluded.
        assert!(!state.should_adopt_predecessor(1000, &node("d", 500)));
        assert!(!state.should_adopt_predecessor(1000, &node("e", 1000)));
    }

    #[test]
    fn finger_cursor_wraps_to_one() {
        let mut state = RingState::new(node("self", 1));
        let mut seen = Vec::new();
        for _ in 0..62 {
            seen.push(state.advance_finger());
        }
        assert_eq!(seen[0], 1);
        assert_eq!(seen[30], 31);
        // Wraps back to 1, never touching finger 0 (the successor).
        assert_eq!(seen[31], 1);
        assert!(seen.iter().all(|i| (1..FINGERS).contains(i)));
    }

    #[test]
    fn forget_resets_pointers() {
        let own = node("self", 100);
        let mut state = RingState::new(own.clone());
        let lost = node("lost", 200);
        state.set_successor(lost.clone());
        state.predecessor = Some(lost.clone());
        state.fingers[3] = Some(lost.clone());
        state.fingers[4] = Some(node("kept", 300));

        state.forget(&own, &lost.node);
        assert_eq!(state.successor(), &own);
        assert_eq!(state.predecessor, None);
        assert_eq!(state.fingers[3], None);
        assert_eq!(state.fingers[4], Some(node("kept", 300)));
    }

    #[test]
    fn decode_node_parses_payload() {
        let payload = Value::document([
            ("Successor", Value::from("host:5000")),
            ("ChordId", Value::from(42_u32)),
        ]);
        let decoded = decode_node(&payload, "Successor").unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.node, NodeId::new("host", 5000));

        assert!(decode_node(&payload, "Predecessor").is_none());
        let bad = Value::document([
            ("Successor", Value::from("host:5000")),
            ("ChordId", Value::from(-1_i64)),
        ]);
        assert!(decode_node(&bad, "Successor").is_none());
    }
}
