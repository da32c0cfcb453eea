//! End-to-end cluster scenarios: in-process nodes talking over real TCP
//! sockets on localhost. Tests are serialized since they bind fixed ports.

use meshdb::chord::Chord;
use meshdb::chunk::ChunkTable;
use meshdb::document::Value;
use meshdb::election::{self, Controller};
use meshdb::network::{kind, Message, MessageStatus, Network, NodeId, SendOptions};

use serial_test::serial;
use std::io::{Read as _, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Elections involve randomized back-off in the tens of seconds; ring and
/// handshake scenarios converge much faster.
const ELECTION_TIMEOUT: Duration = Duration::from_secs(90);
const RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls the condition until it holds or the timeout passes.
fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    condition()
}

/// Starts a network node listening on the given localhost port.
fn node(port: u16) -> Arc<Network> {
    let network = Network::new(NodeId::new("localhost", port));
    network.serve(port).expect("failed to serve");
    network
}

#[test]
#[serial]
fn two_node_handshake() {
    let a = node(19810);
    let b = node(19811);
    assert!(b.connect(a.name().clone()));

    assert!(wait_for(Duration::from_secs(1), || {
        a.connected_nodes() == vec![b.name().clone()]
            && b.connected_nodes() == vec![a.name().clone()]
    }));

    b.shutdown();
    a.shutdown();
}

#[test]
#[serial]
fn join_survives_reconnect() {
    let a = node(19815);
    let b = node(19816);
    assert!(b.connect(a.name().clone()));
    assert!(wait_for(Duration::from_secs(1), || !b.connected_nodes().is_empty()));

    // Kill a; b notices via heartbeats and sweeps the connection.
    a.shutdown();
    assert!(wait_for(Duration::from_secs(10), || b.connected_nodes().is_empty()));

    // A new node on the same address is redialed by the maintenance loop.
    let a = node(19815);
    assert!(wait_for(Duration::from_secs(10), || {
        b.connected_nodes() == vec![a.name().clone()]
    }));

    b.shutdown();
    a.shutdown();
}

#[test]
#[serial]
fn web_page_lists_connections() {
    let a = node(19820);
    let b = node(19821);
    let web = meshdb::web::spawn(a.clone(), 19822);
    assert!(b.connect(a.name().clone()));
    assert!(wait_for(Duration::from_secs(1), || !a.connected_nodes().is_empty()));

    // Give the web runtime a moment to bind, then issue a raw HTTP GET.
    let body = wait_for_http("127.0.0.1:19822", "/connections?json=true");
    assert_eq!(
        body,
        format!(r#"{{"connections":["{}"]}}"#, b.name()),
    );

    let html = wait_for_http("127.0.0.1:19822", "/");
    assert!(html.contains(&b.name().name()));

    b.shutdown();
    a.shutdown();
    web.join().unwrap();
}

/// Fetches a path from the given address, retrying until the server is up,
/// and returns the response body.
fn wait_for_http(addr: &str, path: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match http_get(addr, path) {
            Ok(body) => return body,
            Err(err) => {
                if Instant::now() > deadline {
                    panic!("web interface never came up: {err}");
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn http_get(addr: &str, path: &str) -> std::io::Result<String> {
    let mut socket = std::net::TcpStream::connect(addr)?;
    write!(socket, "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n")?;
    let mut response = String::new();
    socket.read_to_string(&mut response)?;
    match response.split_once("\r\n\r\n") {
        Some((_, body)) => Ok(body.to_owned()),
        None => Err(std::io::ErrorKind::InvalidData.into()),
    }
}

#[test]
#[serial]
fn three_controllers_elect_one_leader() {
    let networks: Vec<Arc<Network>> = vec![node(19830), node(19831), node(19832)];
    let names: Vec<NodeId> = networks.iter().map(|n| n.name().clone()).collect();

    let controllers: Vec<Arc<Controller>> = networks
        .iter()
        .map(|network| {
            let peers: Vec<NodeId> =
                names.iter().filter(|name| *name != network.name()).cloned().collect();
            for peer in &peers {
                network.connect(peer.clone());
            }
            let chunks = Arc::new(ChunkTable::seed(network.name().clone()));
            let controller = Controller::new(network.clone(), peers, chunks);
            controller.serve();
            controller
        })
        .collect();

    // A single leader emerges and every controller converges on it.
    assert!(wait_for(ELECTION_TIMEOUT, || {
        let leaders: Vec<_> = controllers.iter().map(|c| c.leader()).collect();
        let terms: Vec<_> = controllers.iter().map(|c| c.term()).collect();
        leaders.iter().all(|l| l.is_some() && *l == leaders[0])
            && terms.iter().all(|t| *t == terms[0])
            && controllers.iter().filter(|c| c.is_leader()).count() == 1
    }));
    let leader_name = controllers[0].leader().unwrap();
    let leader_index = names.iter().position(|name| *name == leader_name).unwrap();

    // Isolate the leader: with zero of its two peer controllers reachable,
    // it drops below half and steps down.
    for (index, (network, controller)) in networks.iter().zip(&controllers).enumerate() {
        if index != leader_index {
            controller.shutdown();
            network.shutdown();
        }
    }
    let leader = &controllers[leader_index];
    assert!(wait_for(Duration::from_secs(15), || {
        !leader.is_leader() && leader.leader().is_none()
    }));

    controllers[leader_index].shutdown();
    networks[leader_index].shutdown();
}

#[test]
#[serial]
fn candidate_adopts_newer_term_from_refusal() {
    let candidate_network = node(19840);
    let voter = node(19841);

    // The voter is a bare network that refuses every solicitation with a
    // newer term, as a controller at term 7 would.
    let responder = voter.clone();
    voter.subscribe(Box::new(move |message| {
        if message.kind == kind::INITIATE_LEADER_VOTE {
            let payload = Value::document([
                ("Vote", Value::from("No")),
                ("CurrentTerm", Value::from(7_i64)),
            ]);
            responder.send(Message::respond(message, kind::LEADER_VOTE_RESPONSE, payload));
        }
    }));

    assert!(candidate_network.connect(voter.name().clone()));
    let chunks = Arc::new(ChunkTable::seed(candidate_network.name().clone()));
    let controller =
        Controller::new(candidate_network.clone(), vec![voter.name().clone()], chunks);
    controller.serve();

    // The candidate campaigns after its back-off, is refused with term 7,
    // and adopts it without winning.
    assert!(wait_for(Duration::from_secs(30), || controller.term() >= 7));
    assert!(!controller.is_leader());
    assert_eq!(controller.leader(), None);

    controller.shutdown();
    candidate_network.shutdown();
    voter.shutdown();
}

#[test]
#[serial]
fn lone_controller_leads_and_answers_leader_requests() {
    let controller_network = node(19850);
    // The chunk table starts out owned by a node that is gone; winning the
    // election hands the full key range to the new leader.
    let chunks = Arc::new(ChunkTable::seed(NodeId::new("retired-node", 4999)));
    let controller = Controller::new(controller_network.clone(), Vec::new(), chunks.clone());
    controller.serve();

    assert!(wait_for(Duration::from_secs(30), || controller.is_leader()));
    assert_eq!(controller.leader(), Some(controller_network.name().clone()));
    assert!(wait_for(Duration::from_secs(2), || {
        chunks.snapshot()[0].owner == *controller_network.name()
    }));
    assert_eq!(chunks.len(), 1);

    // A database node locates the leader with a LeaderRequest.
    let database = node(19851);
    assert!(database.connect(controller_network.name().clone()));
    let located = election::locate_leader(&database, &[controller_network.name().clone()]);
    let (leader, term) = located.expect("no leader located");
    assert_eq!(leader, controller_network.name().clone());
    assert!(term >= 1);

    database.shutdown();
    controller.shutdown();
    controller_network.shutdown();
}

#[test]
#[serial]
fn request_to_unreachable_peer_fails_without_callback() {
    let a = node(19860);

    let invoked = Arc::new(AtomicBool::new(false));
    let flag = invoked.clone();
    let request = Message::request(
        NodeId::new("127.0.0.1", 19861), // nothing listens here
        kind::LEADER_REQUEST,
        Value::empty(),
    );
    let options = SendOptions {
        timeout: Duration::from_secs(2),
        on_response: Some(Box::new(move |_| flag.store(true, Ordering::SeqCst))),
        ..SendOptions::default()
    };
    let delivery = a.send_with(request, options);
    a.block_until_done(&delivery);

    assert_eq!(delivery.status(), MessageStatus::SendingFailure);
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(delivery.response(), None);

    a.shutdown();
}

#[test]
#[serial]
fn unanswered_request_times_out() {
    let a = node(19865);
    let b = node(19866);
    assert!(a.connect(b.name().clone()));

    // b delivers unknown kinds to its (absent) handlers and never replies.
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = invoked.clone();
    let request = Message::request(b.name().clone(), "NoSuchOperation", Value::empty());
    let options = SendOptions {
        timeout: Duration::from_secs(2),
        on_response: Some(Box::new(move |_| flag.store(true, Ordering::SeqCst))),
        ..SendOptions::default()
    };
    let started = Instant::now();
    let delivery = a.send_with(request, options);
    a.block_until_done(&delivery);

    // The maintenance loop expires the waiter within a tick of the timeout.
    assert_eq!(delivery.status(), MessageStatus::ResponseTimeout);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(!invoked.load(Ordering::SeqCst));

    b.shutdown();
    a.shutdown();
}

#[test]
#[serial]
fn unconsumed_messages_reach_subscribers() {
    let a = node(19870);
    let b = node(19871);
    assert!(a.connect(b.name().clone()));

    let seen = Arc::new(AtomicBool::new(false));
    let flag = seen.clone();
    b.subscribe(Box::new(move |message| {
        if message.kind == "ApplicationEvent" {
            flag.store(true, Ordering::SeqCst);
        }
    }));

    let event = Message::event(b.name().clone(), "ApplicationEvent", Value::empty());
    let delivery = a.send(event);
    a.block_until_done(&delivery);
    assert!(delivery.succeeded());
    assert!(wait_for(Duration::from_secs(2), || seen.load(Ordering::SeqCst)));

    b.shutdown();
    a.shutdown();
}

#[test]
#[serial]
fn chord_ring_stabilizes_three_nodes() {
    let network_a = node(19880);
    let network_b = node(19881);
    let network_c = node(19882);

    let a = Chord::with_id(network_a.clone(), 100);
    a.serve();
    let b = Chord::with_id(network_b.clone(), 200);
    b.join(&[network_a.name().clone()]);
    b.serve();
    let c = Chord::with_id(network_c.clone(), 300);
    c.join(&[network_a.name().clone()]);
    c.serve();

    // Successors rotate forward around the ring, predecessors backward.
    assert!(wait_for(RING_TIMEOUT, || {
        a.successor().id == 200
            && b.successor().id == 300
            && c.successor().id == 100
            && a.predecessor().map(|p| p.id) == Some(300)
            && b.predecessor().map(|p| p.id) == Some(100)
            && c.predecessor().map(|p| p.id) == Some(200)
    }));

    // 250 falls between b and c, so its successor is c; resolving it from
    // a routes through the ring.
    let found = a.find_successor(250).expect("no successor found");
    assert_eq!(found.id, 300);
    assert_eq!(found.node, *network_c.name());

    // Losing c collapses b's successor back and a's predecessor.
    c.shutdown();
    network_c.shutdown();
    assert!(wait_for(RING_TIMEOUT, || {
        b.successor().id != 300 && a.predecessor().map(|p| p.id) != Some(300)
    }));

    b.shutdown();
    a.shutdown();
    network_b.shutdown();
    network_a.shutdown();
}
