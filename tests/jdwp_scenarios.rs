//! End-to-end coverage for spec.md §8 scenarios 4 and 5: a combined
//! glob-class-match-plus-COUNT event modifier, and the JDWP handshake
//! accept/reject behavior of a real socket transport.

use dalvikheap::jdwp::packet::HANDSHAKE;
use dalvikheap::jdwp::transport::Incoming;
use dalvikheap::jdwp::{ClassHierarchy, EventBasket, EventKind, EventStore, JdwpTransport, Modifier, SocketTransport, SuspendPolicy};
use std::io::Write;
use std::net::TcpStream;

struct AlwaysAssignable;
impl ClassHierarchy for AlwaysAssignable {
    fn is_assignable(&self, _candidate: u64, _target: u64) -> bool {
        true
    }
}

/// A class-prepare event that only fires for `com.example.*` classes, and
/// only twice: the third matching class-prepare for that package must no
/// longer be posted once the count reaches zero, regardless of whether
/// the glob still matches it.
#[test]
fn glob_class_match_combined_with_count_expires_after_n_matches() {
    let store = EventStore::new();
    store.register(
        EventKind::ClassPrepare,
        SuspendPolicy::All,
        vec![
            Modifier::ClassMatch { pattern: "com.example.*".to_string() },
            Modifier::Count { remaining: 2 },
        ],
    );
    let hierarchy = AlwaysAssignable;

    let matching = EventBasket { class_name: Some("com.example.Alpha".to_string()), ..Default::default() };
    let other_package = EventBasket { class_name: Some("org.other.Beta".to_string()), ..Default::default() };

    // A non-matching class-prepare must not consume the COUNT budget.
    assert!(store.post(EventKind::ClassPrepare, &other_package, &hierarchy).is_none());
    assert_eq!(store.len(), 1);

    let (policy, ids) = store.post(EventKind::ClassPrepare, &matching, &hierarchy).unwrap();
    assert_eq!(policy, SuspendPolicy::All);
    assert_eq!(ids, vec![1]);
    assert_eq!(store.len(), 1, "one match remaining on the COUNT budget");

    assert!(store.post(EventKind::ClassPrepare, &matching, &hierarchy).is_some());
    assert_eq!(store.len(), 0, "second match exhausts COUNT and unregisters the event");

    // A third class-prepare for the same package now matches nothing.
    assert!(store.post(EventKind::ClassPrepare, &matching, &hierarchy).is_none());
}

fn connect_loopback(port: u16) -> (SocketTransport, TcpStream) {
    let mut transport = SocketTransport::bind(port..=port).unwrap_or_else(|e| panic!("bind {port}: {e}"));
    let (tx, rx) = std::sync::mpsc::channel();
    let accept_thread = std::thread::spawn(move || {
        transport.accept().expect("accept incoming client");
        tx.send(transport).expect("send back accepted transport");
    });
    let client = TcpStream::connect(("127.0.0.1", port)).expect("connect to bound port");
    let transport = rx.recv().expect("accept thread finished");
    accept_thread.join().unwrap();
    (transport, client)
}

#[test]
fn socket_transport_echoes_a_well_formed_handshake() {
    let (mut transport, mut client) = connect_loopback(41234);
    assert!(transport.is_connected());
    assert!(transport.awaiting_handshake());

    client.write_all(HANDSHAKE.as_slice()).unwrap();
    match transport.process_incoming().unwrap() {
        Some(Incoming::Handshake) => {}
        other => panic!("expected handshake, got {:?}", other.is_some()),
    }
    assert!(transport.is_connected());
    assert!(!transport.awaiting_handshake());
}

#[test]
fn socket_transport_closes_connection_on_malformed_handshake() {
    let (mut transport, mut client) = connect_loopback(41235);
    assert!(transport.is_connected());

    client.write_all(b"XXXX-Handshake").unwrap();
    let result = transport.process_incoming().unwrap();
    assert!(result.is_none(), "a malformed handshake must not surface as an incoming unit");
    assert!(!transport.is_connected(), "the connection must be closed on a malformed handshake");
}
