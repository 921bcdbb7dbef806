//! Integration tests for connection and packet ownership

use bytes::Bytes;
use gearman_core::prelude::*;
use std::os::unix::net::UnixStream;

fn connection() -> (Box<dyn Connection>, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    (Box::new(StreamConnection::unix(ours).unwrap()), theirs)
}

#[test]
fn test_counts_track_every_add_and_remove() {
    let mut ctx = Context::new();
    let mut peers = Vec::new();
    let mut ids = Vec::new();

    for expected in 1..=5 {
        let (con, peer) = connection();
        peers.push(peer);
        ids.push(ctx.add_connection(con));
        assert_eq!(ctx.connection_count(), expected);
    }

    ctx.remove_connection(ids[1]).unwrap();
    assert_eq!(ctx.connection_count(), 4);
    ctx.remove_connection(ids[3]).unwrap();
    assert_eq!(ctx.connection_count(), 3);
    assert!(ctx.remove_connection(ids[3]).is_none());
    assert_eq!(ctx.connection_count(), 3);

    assert_eq!(ctx.connection_ids(), vec![ids[0], ids[2], ids[4]]);

    ctx.free_all_connections();
    assert_eq!(ctx.connection_count(), 0);
    assert!(ctx.connection_ids().is_empty());
}

#[test]
fn test_remove_during_dispatch() {
    let mut ctx = Context::new();
    let mut peers = Vec::new();
    for _ in 0..6 {
        let (con, peer) = connection();
        peers.push(peer);
        ctx.add_connection(con);
    }

    for (i, id) in ctx.connection_ids().into_iter().enumerate() {
        if i % 2 == 0 {
            ctx.remove_connection(id);
        }
    }
    assert_eq!(ctx.connection_count(), 3);
}

#[test]
fn test_removed_connection_is_returned_open() {
    let mut ctx = Context::new();
    let (con, _peer) = connection();
    let id = ctx.add_connection(con);
    let con = ctx.remove_connection(id).unwrap();
    assert!(!con.is_closed());
}

#[test]
fn test_free_all_connections_closes_sockets() {
    use std::io::Read;

    let mut ctx = Context::new();
    let (con, mut peer) = connection();
    ctx.add_connection(con);
    ctx.free_all_connections();

    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_packet_registry() {
    let mut ctx = Context::new();
    let mut ids = Vec::new();
    for i in 0..4u8 {
        let packet = Packet::echo_request(Bytes::from(vec![i]));
        match ctx.add_packet(packet) {
            Registration::Tracked(id) => ids.push(id),
            Registration::Untracked(_) => panic!("tracking is on by default"),
        }
        assert_eq!(ctx.packet_count(), usize::from(i) + 1);
    }

    let removed = ctx.remove_packet(ids[2]).unwrap();
    assert_eq!(removed.data().as_ref(), &[2]);
    assert_eq!(ctx.packet_count(), 3);
    assert!(ctx.packet(ids[2]).is_none());
    assert_eq!(ctx.packet(ids[3]).unwrap().data().as_ref(), &[3]);
    assert_eq!(ctx.packet_ids(), vec![ids[0], ids[1], ids[3]]);

    ctx.free_all_packets();
    assert_eq!(ctx.packet_count(), 0);
}

#[test]
fn test_dont_track_packets_toggle() {
    let mut ctx = Context::new();
    ctx.set_option(ContextOption::DontTrackPackets, true).unwrap();
    assert!(matches!(
        ctx.add_packet(Packet::echo_request(Bytes::new())),
        Registration::Untracked(_)
    ));
    assert_eq!(ctx.packet_count(), 0);

    ctx.set_option(ContextOption::DontTrackPackets, false).unwrap();
    assert!(matches!(
        ctx.add_packet(Packet::echo_request(Bytes::new())),
        Registration::Tracked(_)
    ));
    assert_eq!(ctx.packet_count(), 1);
}
