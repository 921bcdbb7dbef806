//! Integration tests for the echo liveness check

use bytes::Bytes;
use gearman_core::prelude::*;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Copy)]
enum Reply {
    Faithful,
    Corrupt,
    WrongCommand,
    Hangup,
}

/// Serve one echo request on `peer`, counting it in `attempts`.
fn serve<S: Read + Write + Send + 'static>(
    mut peer: S,
    reply: Reply,
    attempts: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut header = [0u8; 12];
        peer.read_exact(&mut header).unwrap();
        assert_eq!(&header[..4], b"\0REQ");
        assert_eq!(&header[4..8], &16u32.to_be_bytes());
        let size = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let mut body = vec![0u8; size];
        peer.read_exact(&mut body).unwrap();
        attempts.fetch_add(1, Ordering::SeqCst);

        let response = match reply {
            Reply::Faithful => Packet::new(Magic::Response, Command::EchoRes).with_data(body),
            Reply::Corrupt => {
                body.reverse();
                body.push(b'!');
                Packet::new(Magic::Response, Command::EchoRes).with_data(body)
            }
            Reply::WrongCommand => Packet::new(Magic::Response, Command::Noop),
            Reply::Hangup => return,
        };
        peer.write_all(&response.encode().unwrap()).unwrap();
    })
}

fn context_with_peers(replies: &[Reply], attempts: &Arc<AtomicUsize>) -> (Context, Vec<JoinHandle<()>>) {
    let mut ctx = Context::new();
    ctx.set_timeout(5000);
    let mut servers = Vec::new();
    for &reply in replies {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ctx.add_connection(Box::new(StreamConnection::unix(ours).unwrap()));
        servers.push(serve(theirs, reply, Arc::clone(attempts)));
    }
    (ctx, servers)
}

#[test]
fn test_every_connection_answers() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (mut ctx, servers) = context_with_peers(&[Reply::Faithful; 4], &attempts);

    ctx.echo(Bytes::from_static(b"are you there")).unwrap();
    for server in servers {
        server.join().unwrap();
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(ctx.last_error(), None);
}

#[test]
fn test_one_failure_does_not_short_circuit() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let replies = [Reply::Faithful, Reply::Corrupt, Reply::Faithful, Reply::Faithful];
    let (mut ctx, servers) = context_with_peers(&replies, &attempts);

    let err = ctx.echo(Bytes::from_static(b"payload")).unwrap_err();
    for server in servers {
        server.join().unwrap();
    }
    assert!(matches!(err, GearmanError::EchoDataCorruption));
    assert_eq!(attempts.load(Ordering::SeqCst), replies.len());
    assert_eq!(ctx.last_error(), Some("echo: corruption during echo"));
    assert!(!ctx.is_non_blocking());
}

#[test]
fn test_first_failure_in_registry_order_is_reported() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let replies = [Reply::Faithful, Reply::WrongCommand, Reply::Corrupt, Reply::Hangup];
    let (mut ctx, servers) = context_with_peers(&replies, &attempts);

    let err = ctx.echo(Bytes::from_static(b"payload")).unwrap_err();
    for server in servers {
        server.join().unwrap();
    }
    assert!(matches!(
        err,
        GearmanError::UnexpectedPacket {
            expected: "ECHO_RES",
            got: "NOOP"
        }
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), replies.len());
    assert!(ctx.last_error().unwrap().starts_with("echo: unexpected packet"));
}

#[test]
fn test_hangup_is_lost_connection() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (mut ctx, servers) = context_with_peers(&[Reply::Hangup], &attempts);

    let err = ctx.echo(Bytes::from_static(b"x")).unwrap_err();
    for server in servers {
        server.join().unwrap();
    }
    assert!(err.is_connection_error());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_silent_peer_times_out() {
    let mut ctx = Context::new();
    ctx.set_timeout(20);
    let (ours, _silent) = UnixStream::pair().unwrap();
    ctx.add_connection(Box::new(StreamConnection::unix(ours).unwrap()));

    let err = ctx.echo(Bytes::from_static(b"x")).unwrap_err();
    assert!(matches!(err, GearmanError::TimedOut(20)));
    assert_eq!(ctx.last_error(), Some("echo: timed out after 20 ms"));
}

#[test]
fn test_silent_peer_times_out_beside_dropped_peer() {
    let mut ctx = Context::new();
    ctx.set_timeout(50);
    let (silent, _silent_peer) = UnixStream::pair().unwrap();
    let (dropped, dropped_peer) = UnixStream::pair().unwrap();
    ctx.add_connection(Box::new(StreamConnection::unix(silent).unwrap()));
    ctx.add_connection(Box::new(StreamConnection::unix(dropped).unwrap()));
    drop(dropped_peer);

    let (done, outcome) = mpsc::channel();
    thread::spawn(move || {
        let result = ctx.echo(Bytes::from_static(b"x"));
        done.send((result, ctx.ready())).unwrap();
    });

    let (result, ready) = outcome
        .recv_timeout(Duration::from_secs(3))
        .expect("echo should give up once the timeout passes");
    assert!(matches!(result, Err(GearmanError::TimedOut(50))));
    assert_eq!(ready, None);
}

#[test]
fn test_echo_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = Endpoint::parse(&listener.local_addr().unwrap().to_string()).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut ctx = Context::new();
    ctx.set_timeout(5000);
    let mut servers = Vec::new();
    for _ in 0..3 {
        ctx.add_connection(connect(&endpoint, Some(Duration::from_secs(1))).unwrap());
        let (stream, _) = listener.accept().unwrap();
        servers.push(serve(stream, Reply::Faithful, Arc::clone(&attempts)));
    }

    ctx.echo(vec![7u8; 64 * 1024]).unwrap();
    for server in servers {
        server.join().unwrap();
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
