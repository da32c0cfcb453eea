//! Term-based leader election among the configured controller nodes.
//!
//! Every controller tracks a monotonically non-decreasing term and casts at
//! most one vote per term. A candidate increments the term, solicits votes
//! from every other controller, and assumes leadership on a strict majority
//! of the configured controller set. Liveness comes from randomized
//! candidate back-off separating competing candidates; safety from the
//! single vote per term and the term tiebreak on NewLeader announcements.

use crate::chunk::{ChunkTable, Marker};
use crate::document::Value;
use crate::network::{kind, Handler, Message, Network, NodeId, SendOptions};
use crate::util::responsive_sleep;

use log::{debug, info};
use rand::Rng as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Tick of the election maintenance loop.
const ELECTION_TICK: Duration = Duration::from_secs(1);
/// Base unit of the randomized candidate back-off, in seconds. A reset
/// back-off lands uniformly in [unit, unit · cluster size].
const BACKOFF_UNIT_SECS: u64 = 5;
/// Response timeout for vote solicitations and leader lookups.
const VOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// The size of the majority quorum for the given cluster size.
fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// The connected-peer count below which a leader steps down. Deliberately
/// strict-less-than half: with an even cluster size a leader holds on at
/// exactly half its peers.
fn step_down_threshold(cluster_size: usize) -> usize {
    cluster_size / 2
}

/// A reply to a vote solicitation.
#[derive(Debug, PartialEq)]
pub enum Vote {
    Yes,
    No { current_term: i64 },
}

/// Election state, kept under the controller's single readers-writer lock.
pub struct LeaderState {
    /// The current election term. Monotonically non-decreasing.
    pub term: i64,
    /// Whether this node has voted in the current term.
    pub voted_this_term: bool,
    /// The known leader, if any.
    pub leader: Option<NodeId>,
    /// Whether this node is the leader.
    pub is_leader: bool,
    /// When this node may next stand as a candidate.
    pub next_candidate_at: Instant,
}

impl LeaderState {
    fn new() -> Self {
        Self {
            term: 0,
            voted_this_term: false,
            leader: None,
            is_leader: false,
            next_candidate_at: Instant::now(),
        }
    }

    /// Decides a vote solicitation for the given term. A vote is granted
    /// for a newer term, or for the current term if no vote was cast yet;
    /// anything else is refused with our current term as tiebreaker.
    pub fn handle_vote_request(&mut self, term: i64) -> Vote {
        if term > self.term || (term == self.term && !self.voted_this_term) {
            self.term = term;
            self.voted_this_term = true;
            return Vote::Yes;
        }
        Vote::No { current_term: self.term }
    }

    /// Applies a NewLeader announcement. An empty leader means the sender
    /// stepped down; a named leader is only adopted in the current term,
    /// since newer terms always win and older ones are stale.
    pub fn handle_new_leader(&mut self, leader: Option<NodeId>, term: i64) {
        match leader {
            None => {
                self.leader = None;
                self.is_leader = false;
            }
            Some(leader) if term == self.term => {
                self.leader = Some(leader);
                self.is_leader = false;
            }
            Some(leader) => debug!("Ignoring leader {leader} from term {term} (at {})", self.term),
        }
    }

    /// Resets the candidate back-off to a fresh random draw.
    pub fn reset_backoff(&mut self, cluster_size: usize) {
        let unit = BACKOFF_UNIT_SECS;
        let secs = rand::thread_rng().gen_range(unit..=unit * cluster_size.max(2) as u64);
        self.next_candidate_at = Instant::now() + Duration::from_secs(secs);
    }
}

/// A controller node: participates in leader election over the network,
/// answers leader lookups from database nodes, and claims the node's chunk
/// table when it wins.
pub struct Controller {
    network: Arc<Network>,
    /// The other configured controllers. The cluster additionally includes
    /// this node.
    peers: Vec<NodeId>,
    /// The node's chunk lookup table. The election winner takes over the
    /// full key range while the table is still a single unsplit chunk.
    chunks: Arc<ChunkTable>,
    state: RwLock<LeaderState>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Creates a controller and registers it with the network. The peer
    /// set is the other controllers; this node is excluded if present.
    pub fn new(
        network: Arc<Network>,
        mut peers: Vec<NodeId>,
        chunks: Arc<ChunkTable>,
    ) -> Arc<Self> {
        peers.retain(|peer| peer != network.name());
        peers.sort();
        peers.dedup();
        let controller = Arc::new(Self {
            network: network.clone(),
            peers,
            chunks,
            state: RwLock::new(LeaderState::new()),
            running: Arc::new(AtomicBool::new(true)),
            thread: Mutex::new(None),
        });
        {
            let mut state = controller.state.write().expect("lock poisoned");
            state.reset_backoff(controller.cluster_size());
        }
        let handler: Arc<dyn Handler> = controller.clone();
        network.register(Arc::downgrade(&handler));
        controller
    }

    /// Starts the election maintenance loop.
    pub fn serve(self: &Arc<Self>) {
        let controller = self.clone();
        let handle = std::thread::spawn(move || {
            while responsive_sleep(&controller.running, ELECTION_TICK) {
                controller.tick();
            }
        });
        *self.thread.lock().expect("lock poisoned") = Some(handle);
    }

    /// Stops the maintenance loop.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().expect("lock poisoned").take() {
            if handle.join().is_err() {
                log::error!("Election thread panicked during shutdown");
            }
        }
    }

    /// The configured controller count, including this node.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// The current leader, if known.
    pub fn leader(&self) -> Option<NodeId> {
        self.state.read().expect("lock poisoned").leader.clone()
    }

    /// Whether this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.state.read().expect("lock poisoned").is_leader
    }

    /// The current term.
    pub fn term(&self) -> i64 {
        self.state.read().expect("lock poisoned").term
    }

    /// One maintenance tick: campaign when leaderless and past back-off.
    fn tick(&self) {
        let campaign = {
            let state = self.state.read().expect("lock poisoned");
            state.leader.is_none() && Instant::now() >= state.next_candidate_at
        };
        if campaign {
            self.campaign();
        }
    }

    /// Stands as a candidate: bumps the term, votes for ourself, solicits
    /// votes from every other controller, and assumes leadership on a
    /// strict majority in an unchanged term.
    fn campaign(&self) {
        let attempt = {
            let mut state = self.state.write().expect("lock poisoned");
            state.term += 1;
            state.voted_this_term = true;
            state.term
        };
        info!("Campaigning for leadership in term {attempt}");

        let deliveries: Vec<_> = self
            .peers
            .iter()
            .map(|peer| {
                let request = Message::request(
                    peer.clone(),
                    kind::INITIATE_LEADER_VOTE,
                    Value::document([("CurrentTerm", attempt)]),
                );
                self.network.send_with(request, SendOptions::timeout(VOTE_TIMEOUT))
            })
            .collect();

        // Tally the replies: one implicit vote for ourself, one per Yes.
        // Track the newest term seen in a refusal.
        let mut yes_votes = 1;
        let mut newer_term = None;
        for delivery in deliveries {
            self.network.block_until_done(&delivery);
            let Some(response) = delivery.response() else { continue };
            match response.payload.get_str("Vote") {
                Some("Yes") => yes_votes += 1,
                Some("No") => {
                    if let Some(term) = response.payload.get_i64("CurrentTerm") {
                        if term > attempt && Some(term) > newer_term {
                            newer_term = Some(term);
                        }
                    }
                }
                _ => debug!("Ignoring malformed vote response from {}", response.address),
            }
        }

        // A refusal from a newer term aborts the attempt and adopts it.
        if let Some(term) = newer_term {
            info!("Vote refused by newer term {term}, abandoning campaign");
            let mut state = self.state.write().expect("lock poisoned");
            if term > state.term {
                state.term = term;
                state.voted_this_term = false;
            }
            state.reset_backoff(self.cluster_size());
            return;
        }

        let won = {
            let mut state = self.state.write().expect("lock poisoned");
            if state.term == attempt && yes_votes >= quorum_size(self.cluster_size()) {
                state.leader = Some(self.network.name().clone());
                state.is_leader = true;
                true
            } else {
                state.reset_backoff(self.cluster_size());
                false
            }
        };
        if won {
            info!("Won election with {yes_votes} votes, leading term {attempt}");
            // The exact-endpoint match only succeeds while the table is
            // still fresh: a single chunk spanning the whole key axis.
            if self.chunks.update_owner(&Marker::Start, &Marker::End, self.network.name().clone())
            {
                info!("Claimed ownership of the full key range");
            }
            self.network.broadcast(
                kind::NEW_LEADER,
                Value::document([
                    ("Leader", Value::from(self.network.name().name())),
                    ("CurrentTerm", Value::from(attempt)),
                ]),
            );
        } else {
            info!("Lost election for term {attempt} with {yes_votes} votes");
        }
    }

    /// Steps down as leader: clears leadership, resets back-off, and
    /// announces an empty leader to every connected peer.
    fn step_down(&self) {
        let term = {
            let mut state = self.state.write().expect("lock poisoned");
            state.leader = None;
            state.is_leader = false;
            state.reset_backoff(self.cluster_size());
            state.term
        };
        info!("Stepping down as leader of term {term}");
        self.network.broadcast(
            kind::NEW_LEADER,
            Value::document([("Leader", Value::from("")), ("CurrentTerm", Value::from(term))]),
        );
    }
}

impl Handler for Controller {
    fn message(&self, message: &Message) -> bool {
        match message.kind.as_str() {
            kind::INITIATE_LEADER_VOTE => {
                let Some(term) = message.payload.get_i64("CurrentTerm") else {
                    debug!("Dropping vote solicitation without term");
                    return true;
                };
                let vote = self.state.write().expect("lock poisoned").handle_vote_request(term);
                let payload = match vote {
                    Vote::Yes => {
                        info!("Voting for {} in term {term}", message.address);
                        Value::document([("Vote", Value::from("Yes"))])
                    }
                    Vote::No { current_term } => Value::document([
                        ("Vote", Value::from("No")),
                        ("CurrentTerm", Value::from(current_term)),
                    ]),
                };
                self.network.send(Message::respond(message, kind::LEADER_VOTE_RESPONSE, payload));
                true
            }

            kind::NEW_LEADER => {
                let Some(term) = message.payload.get_i64("CurrentTerm") else { return true };
                let leader = match message.payload.get_str("Leader") {
                    Some("") => None,
                    Some(name) => match name.parse::<NodeId>() {
                        Ok(leader) => Some(leader),
                        Err(err) => {
                            debug!("Dropping NewLeader with bad name: {err}");
                            return true;
                        }
                    },
                    None => return true,
                };
                match &leader {
                    Some(leader) => info!("Peer announced leader {leader} for term {term}"),
                    None => info!("Leader of term {term} stepped down"),
                }
                self.state.write().expect("lock poisoned").handle_new_leader(leader, term);
                true
            }

            kind::LEADER_REQUEST => {
                let (leader, term) = {
                    let state = self.state.read().expect("lock poisoned");
                    (state.leader.as_ref().map(NodeId::name).unwrap_or_default(), state.term)
                };
                let payload = Value::document([
                    ("Leader", Value::from(leader)),
                    ("CurrentTerm", Value::from(term)),
                ]);
                self.network.send(Message::respond(message, kind::LEADER_RESPONSE, payload));
                true
            }

            _ => false,
        }
    }

    fn disconnected(&self, peer: &NodeId) {
        // Snapshot connectivity before taking the state lock; the registry
        // and election locks are never held together.
        let connected = self.network.connected_nodes();
        let connected_controllers =
            self.peers.iter().filter(|controller| connected.contains(controller)).count();

        let mut stepped_down = false;
        {
            let mut state = self.state.write().expect("lock poisoned");
            if state.leader.as_ref() == Some(peer) {
                info!("Lost connection to leader {peer}");
                state.leader = None;
                state.reset_backoff(self.cluster_size());
            }
            if state.is_leader && connected_controllers < step_down_threshold(self.cluster_size()) {
                stepped_down = true;
            }
        }
        if stepped_down {
            info!(
                "Only {connected_controllers} of {} controllers reachable, stepping down",
                self.peers.len()
            );
            self.step_down();
        }
    }
}

/// Asks the given nodes for the current leader, as database nodes do, and
/// returns the first leader any of them reports along with its term.
pub fn locate_leader(network: &Network, nodes: &[NodeId]) -> Option<(NodeId, i64)> {
    for node in nodes {
        let request = Message::request(node.clone(), kind::LEADER_REQUEST, Value::empty());
        let Some(response) = network.call(request, VOTE_TIMEOUT) else { continue };
        let term = response.payload.get_i64("CurrentTerm").unwrap_or(0);
        match response.payload.get_str("Leader") {
            Some("") | None => continue,
            Some(name) => match name.parse::<NodeId>() {
                Ok(leader) => return Some((leader, term)),
                Err(err) => debug!("Node {node} reported invalid leader: {err}"),
            },
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_sizes() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn step_down_thresholds() {
        // Strict-less-than half: a leader of five steps down below 2
        // connected peers, a leader of four holds on at exactly 2.
        assert_eq!(step_down_threshold(5), 2);
        assert_eq!(step_down_threshold(4), 2);
        assert_eq!(step_down_threshold(3), 1);
    }

    #[test]
    fn vote_granted_for_new_term() {
        let mut state = LeaderState::new();
        assert_eq!(state.handle_vote_request(1), Vote::Yes);
        assert_eq!(state.term, 1);
        assert!(state.voted_this_term);
    }

    #[test]
    fn one_vote_per_term() {
        let mut state = LeaderState::new();
        assert_eq!(state.handle_vote_request(3), Vote::Yes);
        // A second candidate in the same term is refused.
        assert_eq!(state.handle_vote_request(3), Vote::No { current_term: 3 });
        // A newer term gets a fresh vote.
        assert_eq!(state.handle_vote_request(4), Vote::Yes);
    }

    #[test]
    fn stale_term_refused_with_tiebreak() {
        let mut state = LeaderState::new();
        state.term = 7;
        assert_eq!(state.handle_vote_request(5), Vote::No { current_term: 7 });
        assert_eq!(state.term, 7);
    }

    #[test]
    fn unvoted_current_term_granted() {
        let mut state = LeaderState::new();
        state.term = 2;
        state.voted_this_term = false;
        assert_eq!(state.handle_vote_request(2), Vote::Yes);
    }

    #[test]
    fn new_leader_adopted_in_current_term() {
        let mut state = LeaderState::new();
        state.term = 2;
        let leader = NodeId::new("a", 1);
        state.handle_new_leader(Some(leader.clone()), 2);
        assert_eq!(state.leader, Some(leader));
        assert!(!state.is_leader);
    }

    #[test]
    fn new_leader_ignored_in_other_term() {
        let mut state = LeaderState::new();
        state.term = 2;
        state.handle_new_leader(Some(NodeId::new("a", 1)), 1);
        assert_eq!(state.leader, None);
        state.handle_new_leader(Some(NodeId::new("a", 1)), 3);
        assert_eq!(state.leader, None);
    }

    #[test]
    fn empty_leader_clears_leadership() {
        let mut state = LeaderState::new();
        state.term = 2;
        state.leader = Some(NodeId::new("a", 1));
        state.is_leader = true;
        state.handle_new_leader(None, 1); // term is irrelevant for step-downs
        assert_eq!(state.leader, None);
        assert!(!state.is_leader);
    }

    #[test]
    fn backoff_is_randomized_within_range() {
        let mut state = LeaderState::new();
        for _ in 0..100 {
            let before = Instant::now();
            state.reset_backoff(3);
            let delay = state.next_candidate_at - before;
            assert!(delay >= Duration::from_secs(BACKOFF_UNIT_SECS));
            assert!(delay <= Duration::from_secs(BACKOFF_UNIT_SECS * 3) + Duration::from_secs(1));
        }
    }
}
