mod common;

use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use comlink_core::protocol::{Command, Frame};
use comlink_core::{
    wire, ConnectionManager, Event, EventKind, LinkConfig, LinkError, LinkObserver, Radio,
    SharedReadings, TcpRadio, Waiter,
};
use rand::RngCore;
use tempfile::tempdir;

use common::{config_in, linked_pair, open, tcp_pair, wait_until, WAIT};

fn observe(link: &comlink_core::VirtualLink, kind: EventKind) -> Arc<Waiter> {
    let waiter = Waiter::new();
    link.register(waiter.clone(), kind);
    waiter
}

#[test]
fn pushed_values_reach_observers() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    let (a, b) = linked_pair(da.path(), db.path());
    let waiter = observe(&b, EventKind::Degree);
    let seen = waiter.generation();
    a.write_degree(90.0).unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    assert_eq!(waiter.last_event(), Some(Event::Degree(90.0)));
    assert_eq!(b.remote_degree(), Some(90.0));
    a.shutdown();
    b.shutdown();
}

#[test]
fn out_of_range_value_is_rejected_and_not_cached() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    let (a, b) = linked_pair(da.path(), db.path());
    let waiter = observe(&b, EventKind::Light);
    let seen = waiter.generation();
    a.write_light_value(101.0).unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    assert_eq!(
        waiter.last_event(),
        Some(Event::Rejected {
            kind: EventKind::Light,
            value: 101.0
        })
    );
    assert_eq!(b.remote_light_value(), None);
    assert!(!b.is_closed());
    a.shutdown();
    b.shutdown();
}

#[test]
fn values_outside_either_bound_are_rejected() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    let (a, b) = linked_pair(da.path(), db.path());
    let degrees = observe(&b, EventKind::Degree);
    let lights = observe(&b, EventKind::Light);

    let seen = degrees.generation();
    a.write_degree(400.0).unwrap();
    assert!(degrees.wait_past(seen, WAIT));
    assert_eq!(
        degrees.last_event(),
        Some(Event::Rejected {
            kind: EventKind::Degree,
            value: 400.0
        })
    );
    assert_eq!(b.remote_degree(), None);

    let seen = lights.generation();
    a.write_light_value(-5.0).unwrap();
    assert!(lights.wait_past(seen, WAIT));
    assert_eq!(
        lights.last_event(),
        Some(Event::Rejected {
            kind: EventKind::Light,
            value: -5.0
        })
    );
    assert_eq!(b.remote_light_value(), None);

    let seen = degrees.generation();
    a.write_degree(359.0).unwrap();
    assert!(degrees.wait_past(seen, WAIT));
    assert_eq!(b.remote_degree(), Some(359.0));
    a.shutdown();
    b.shutdown();
}

#[test]
fn requests_are_answered_from_the_provider() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    let (a, b) = linked_pair(da.path(), db.path());
    let readings = SharedReadings::new();
    readings.set_degree(181.5);
    readings.set_light_value(12.0);
    b.set_value_provider(readings);

    let waiter = Waiter::new();
    let observer: Arc<dyn LinkObserver> = waiter.clone();
    let seen = waiter.generation();
    a.request_degree(Some(&observer)).unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    assert_eq!(a.remote_degree(), Some(181.5));

    let seen = waiter.generation();
    a.request_light_value(Some(&observer)).unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    assert_eq!(a.remote_light_value(), Some(12.0));
    a.shutdown();
    b.shutdown();
}

#[test]
fn small_file_arrives_whole() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    fs::write(da.path().join("notes.txt"), b"turn left at the wall").unwrap();
    let (a, b) = linked_pair(da.path(), db.path());
    let waiter = observe(&b, EventKind::File);
    let seen = waiter.generation();
    a.write_file("notes.txt").unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    let stored = db.path().join("notes.txt");
    assert_eq!(
        waiter.last_event(),
        Some(Event::File(stored.display().to_string()))
    );
    assert_eq!(fs::read(&stored).unwrap(), b"turn left at the wall");
    a.shutdown();
    b.shutdown();
}

#[test]
fn large_file_arrives_in_parts_and_is_reassembled() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    let mut data = vec![0u8; 1050];
    rand::thread_rng().fill_bytes(&mut data);
    fs::write(da.path().join("map.bin"), &data).unwrap();

    let (sa, sb) = tcp_pair();
    let small_parts = |dir: &std::path::Path| LinkConfig {
        file_part_size: 100,
        ..config_in(dir)
    };
    let a = open("A", "B", sa, small_parts(da.path()));
    let b = open("B", "A", sb, small_parts(db.path()));
    let waiter = observe(&b, EventKind::File);
    let seen = waiter.generation();
    a.write_file("map.bin").unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    let stored = db.path().join("map.bin");
    assert_eq!(fs::read(&stored).unwrap(), data);
    assert!(!db.path().join("map.bin0").exists());
    assert!(!db.path().join("map.bin10").exists());
    assert!(!b.is_receiving_file());
    a.shutdown();
    b.shutdown();
}

#[test]
fn requested_file_is_sent_back() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    fs::write(db.path().join("log.txt"), b"42").unwrap();
    let (a, b) = linked_pair(da.path(), db.path());
    let waiter = Waiter::new();
    let observer: Arc<dyn LinkObserver> = waiter.clone();
    let seen = waiter.generation();
    a.request_file("log.txt", Some(&observer)).unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    assert_eq!(fs::read(da.path().join("log.txt")).unwrap(), b"42");

    let seen = waiter.generation();
    a.request_file("missing.txt", Some(&observer)).unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    assert_eq!(waiter.last_event(), Some(Event::File(String::new())));
    assert_eq!(a.remote_file_name().as_deref(), Some(""));
    a.shutdown();
    b.shutdown();
}

#[test]
fn graceful_close_closes_both_ends() {
    let (da, db) = (tempdir().unwrap(), tempdir().unwrap());
    let (a, b) = linked_pair(da.path(), db.path());
    let waiter = observe(&b, EventKind::Close);
    assert!(a.close_gracefully(WAIT));
    assert!(a.is_closed());
    assert!(wait_until(|| b.is_closed()));
    assert!(waiter.saw_close());
    assert!(matches!(a.write_degree(1.0), Err(LinkError::ConnectionClosed)));
}

#[test]
fn close_is_declined_during_a_file_transfer() {
    let dir = tempdir().unwrap();
    let (sa, mut raw) = tcp_pair();
    let a = open("A", "B", sa, config_in(dir.path()));
    let files = observe(&a, EventKind::File);

    let first = Frame::FilePart {
        total_parts: 2,
        name: "big.bin0".into(),
        data: vec![1; 10],
    };
    raw.write_all(&wire::encode_frame(&first)).unwrap();
    raw.write_all(&wire::encode_frame(&Frame::Command(Command::Close))).unwrap();
    assert_eq!(
        wire::read_frame(&mut raw).unwrap(),
        Some(Frame::Command(Command::CloseDecline))
    );
    assert!(!a.is_closed());
    assert!(a.is_receiving_file());

    let seen = files.generation();
    let second = Frame::FilePart {
        total_parts: 2,
        name: "big.bin1".into(),
        data: vec![2; 5],
    };
    raw.write_all(&wire::encode_frame(&second)).unwrap();
    assert!(files.wait_past(seen, WAIT));
    let mut expected: Vec<u8> = vec![1; 10];
    expected.extend([2; 5]);
    assert_eq!(fs::read(dir.path().join("big.bin")).unwrap(), expected);

    raw.write_all(&wire::encode_frame(&Frame::Command(Command::Close))).unwrap();
    assert_eq!(
        wire::read_frame(&mut raw).unwrap(),
        Some(Frame::Command(Command::CloseAck))
    );
    assert!(wait_until(|| a.is_closed()));
}

#[test]
fn truncated_transfer_keeps_received_parts_and_drops_the_partial_one() {
    let dir = tempdir().unwrap();
    let (sa, mut raw) = tcp_pair();
    let a = open("A", "B", sa, config_in(dir.path()));
    let files = observe(&a, EventKind::File);

    let first = Frame::FilePart {
        total_parts: 3,
        name: "big.bin0".into(),
        data: vec![1; 10],
    };
    raw.write_all(&wire::encode_frame(&first)).unwrap();
    assert!(wait_until(|| a.is_receiving_file()));

    let second = wire::encode_frame(&Frame::FilePart {
        total_parts: 3,
        name: "big.bin1".into(),
        data: vec![2; 10],
    });
    raw.write_all(&second[..second.len() - 4]).unwrap();
    drop(raw);

    let stored = dir.path().join("big.bin");
    assert!(wait_until(
        || files.last_event() == Some(Event::File(stored.display().to_string()))
    ));
    assert_eq!(fs::read(&stored).unwrap(), vec![1; 10]);
    assert!(!dir.path().join("big.bin0").exists());
    assert!(!dir.path().join("big.bin1").exists());
    assert!(!a.is_receiving_file());
    assert!(wait_until(|| a.is_closed()));
}

#[test]
fn declined_close_keeps_the_link_usable() {
    let dir = tempdir().unwrap();
    let (sa, mut raw) = tcp_pair();
    let a = open("A", "B", sa, config_in(dir.path()));
    let waiter = Waiter::new();
    let observer: Arc<dyn LinkObserver> = waiter.clone();
    let seen = waiter.generation();
    a.request_close(&observer).unwrap();
    assert_eq!(
        wire::read_frame(&mut raw).unwrap(),
        Some(Frame::Command(Command::Close))
    );
    raw.write_all(&wire::encode_frame(&Frame::Command(Command::CloseDecline)))
        .unwrap();
    assert!(waiter.wait_past(seen, WAIT));
    assert_eq!(waiter.last_event(), Some(Event::CloseDeclined));
    assert!(!a.is_closed());
    a.write_degree(5.0).unwrap();
    assert_eq!(wire::read_frame(&mut raw).unwrap(), Some(Frame::Degree(5.0)));
    a.shutdown();
}

#[test]
fn simultaneous_close_is_acknowledged() {
    let dir = tempdir().unwrap();
    let (sa, mut raw) = tcp_pair();
    let a = open("A", "B", sa, config_in(dir.path()));
    let waiter = Waiter::new();
    let observer: Arc<dyn LinkObserver> = waiter.clone();
    a.request_close(&observer).unwrap();
    assert_eq!(
        wire::read_frame(&mut raw).unwrap(),
        Some(Frame::Command(Command::Close))
    );
    raw.write_all(&wire::encode_frame(&Frame::Command(Command::Close))).unwrap();
    assert_eq!(
        wire::read_frame(&mut raw).unwrap(),
        Some(Frame::Command(Command::CloseAck))
    );
    assert!(wait_until(|| a.is_closed()));
    assert!(waiter.saw_close());
}

#[test]
fn manager_reuses_open_connections() {
    let dir = tempdir().unwrap();
    let radio_b = TcpRadio::bind("NXT2", "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = radio_b.local_addr().unwrap();
    let radio_b: Arc<dyn Radio> = Arc::new(radio_b);
    let radio_a: Arc<dyn Radio> = Arc::new(TcpRadio::new("NXT1").with_peer("NXT2", addr));

    let manager_b = ConnectionManager::direct("NXT2", config_in(dir.path()), radio_b);
    let manager_a = ConnectionManager::direct("NXT1", config_in(dir.path()), radio_a);
    let acceptor = thread::spawn(move || {
        let link = manager_b.accept_direct(WAIT).unwrap().unwrap();
        (manager_b, link)
    });

    let first = manager_a.direct_connection("NXT2").unwrap();
    let (manager_b, accepted) = acceptor.join().unwrap();
    assert_eq!(accepted.remote_name(), "NXT1");

    let second = manager_a.direct_connection("NXT2").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.users(), 2);

    assert!(second.close_gracefully(WAIT));
    assert_eq!(first.users(), 1);
    assert!(!first.is_closed());

    manager_a.close();
    assert!(first.is_closed());
    assert!(wait_until(|| accepted.is_closed()));
    assert!(wait_until(|| manager_b.connections().is_empty()));
    assert!(manager_a.connection_to("NXT2").is_none());
}
