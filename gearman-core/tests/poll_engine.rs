//! Integration tests for wait/ready

use gearman_core::prelude::*;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

fn add_pairs(ctx: &mut Context, n: usize) -> (Vec<ConnectionId>, Vec<UnixStream>) {
    let mut ids = Vec::new();
    let mut peers = Vec::new();
    for _ in 0..n {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ids.push(ctx.add_connection(Box::new(StreamConnection::unix(ours).unwrap())));
        peers.push(theirs);
    }
    (ids, peers)
}

#[test]
fn test_wait_without_connections_fails() {
    let mut ctx = Context::new();
    ctx.set_timeout(10);
    let err = ctx.wait().unwrap_err();
    assert!(matches!(err, GearmanError::NoActiveFds));
    assert!(ctx.last_error().is_some());
}

#[test]
fn test_three_connections_time_out() {
    let mut ctx = Context::new();
    ctx.set_timeout(10);
    let (_ids, _peers) = add_pairs(&mut ctx, 3);

    let start = Instant::now();
    let outcome = ctx.wait().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(9), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(100), "returned after {elapsed:?}");
    assert_eq!(ctx.ready(), None);
    assert_eq!(ctx.last_error(), None);
}

#[test]
fn test_ready_hands_out_each_connection_once_in_order() {
    let mut ctx = Context::new();
    ctx.set_timeout(1000);
    let (ids, mut peers) = add_pairs(&mut ctx, 4);

    peers[3].write_all(b"\0RES").unwrap();
    peers[1].write_all(b"\0RES").unwrap();

    assert_eq!(ctx.wait().unwrap(), WaitOutcome::Ready(2));
    assert_eq!(ctx.ready(), Some(ids[1]));
    assert_eq!(ctx.ready(), Some(ids[3]));
    assert_eq!(ctx.ready(), None);
    assert!(ctx.readiness(ids[1]).unwrap().contains(Readiness::READABLE));
    assert!(ctx.readiness(ids[0]).unwrap().is_empty());
}

#[test]
fn test_removed_connection_is_never_ready() {
    let mut ctx = Context::new();
    ctx.set_timeout(1000);
    let (ids, mut peers) = add_pairs(&mut ctx, 2);
    peers[0].write_all(b"x").unwrap();
    peers[1].write_all(b"x").unwrap();

    ctx.wait().unwrap();
    ctx.remove_connection(ids[0]);
    assert_eq!(ctx.ready(), Some(ids[1]));
    assert_eq!(ctx.ready(), None);
}

#[test]
fn test_wait_flushes_pending_sends_first() {
    use std::io::Read;

    let mut ctx = Context::with_config(ContextConfig::new().with_non_blocking(true).with_timeout(0));
    let (ids, mut peers) = add_pairs(&mut ctx, 1);

    let packet = Packet::echo_request(bytes::Bytes::from_static(b"queued"));
    ctx.connection_mut(ids[0]).unwrap().send(&packet).unwrap();
    assert_eq!(ctx.pending_sends(), 1);

    ctx.wait().unwrap();
    assert_eq!(ctx.pending_sends(), 0);

    let mut wire = vec![0u8; packet.wire_len()];
    peers[0].read_exact(&mut wire).unwrap();
    assert_eq!(wire, packet.encode().unwrap());
}

#[test]
fn test_poll_capacity_grows_not_shrinks() {
    let mut ctx = Context::with_config(ContextConfig::new().with_poll_capacity(2).with_timeout(0));
    let (ids, _peers) = add_pairs(&mut ctx, 5);
    ctx.wait().unwrap();
    for id in &ids[..4] {
        ctx.remove_connection(*id);
    }
    ctx.wait().unwrap();
    assert!(format!("{ctx:?}").contains("poll_capacity: 8"));
}

#[test]
fn test_closed_connections_are_not_polled() {
    let mut ctx = Context::new();
    ctx.set_timeout(0);
    let (ids, _peers) = add_pairs(&mut ctx, 1);
    ctx.connection_mut(ids[0]).unwrap().close();
    assert!(matches!(ctx.wait(), Err(GearmanError::NoActiveFds)));
}
