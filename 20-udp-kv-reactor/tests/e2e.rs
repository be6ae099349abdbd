//! End-to-end tests over real UDP sockets on localhost.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use prost::Message;
use udp_kv_reactor::{
    client::KvClient,
    dispatcher::DispatcherKind,
    protocol::{self, Command, Envelope, ErrorCode, Request, Response},
    server::{Server, ServerConfig},
};

fn spawn_server(dispatcher: DispatcherKind) -> Result<(Server, SocketAddr)> {
    let config = ServerConfig {
        dispatcher,
        ..ServerConfig::bound_to("127.0.0.1:0".parse()?)
    };
    let mut server = Server::new(config)?;
    server.start()?;
    let addr = server.local_addrs()[0];
    Ok((server, addr))
}

fn client(addr: SocketAddr) -> Result<KvClient> {
    Ok(KvClient::connect(addr)?
        .with_timeout(Duration::from_millis(250))
        .with_retries(4))
}

fn raw_socket() -> Result<UdpSocket> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    socket.set_read_timeout(Some(Duration::from_millis(300)))?;
    Ok(socket)
}

fn recv_raw(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 64 * 1024];
    socket.recv_from(&mut buf).ok().map(|(n, _)| buf[..n].to_vec())
}

fn scenario(dispatcher: DispatcherKind) -> Result<()> {
    let (mut server, addr) = spawn_server(dispatcher)?;
    let client = client(addr)?;

    let put_id = b"scenario-put".to_vec();
    let put = Request::put("a", "1", 0);
    assert_eq!(client.send_with_id(&put_id, &put)?, Response::ok());

    let got = client.get(b"a")?;
    assert_eq!(got.code(), Some(ErrorCode::None));
    assert_eq!(got.value.as_deref(), Some(&b"1"[..]));
    assert_eq!(got.version, Some(0));

    // Retransmitting the first envelope returns the same answer and does not
    // touch the stored entry.
    assert_eq!(client.send_with_id(&put_id, &put)?, Response::ok());
    assert_eq!(server.store().get(b"a").map(|e| e.version), Some(0));

    assert_eq!(client.remove(b"a")?, Response::ok());
    assert_eq!(client.get(b"a")?.code(), Some(ErrorCode::NonExistentKey));

    server.stop();
    Ok(())
}

#[test]
fn scenario_with_pooled_dispatcher() -> Result<()> {
    scenario(DispatcherKind::Pooled)
}

#[test]
fn scenario_with_inline_dispatcher() -> Result<()> {
    scenario(DispatcherKind::Inline)
}

#[test]
fn duplicate_envelope_gets_byte_identical_reply() -> Result<()> {
    let (mut server, addr) = spawn_server(DispatcherKind::Pooled)?;
    let socket = raw_socket()?;

    let datagram = protocol::encode_envelope(
        b"dup-id",
        &protocol::encode_request(&Request::put("counter", "1", 1)),
    );
    socket.send_to(&datagram, addr)?;
    let first = recv_raw(&socket).expect("first reply");

    // Change the stored value under a different id, then replay.
    let other = client(addr)?;
    assert_eq!(other.put(b"counter", b"2", 2)?, Response::ok());

    socket.send_to(&datagram, addr)?;
    let second = recv_raw(&socket).expect("second reply");

    assert_eq!(first, second);
    let entry = server.store().get(b"counter").expect("entry");
    assert_eq!(entry.value, b"2");
    assert_eq!(entry.version, 2);

    server.stop();
    Ok(())
}

#[test]
fn malformed_and_corrupt_packets_get_no_reply() -> Result<()> {
    let (mut server, addr) = spawn_server(DispatcherKind::Pooled)?;
    let socket = raw_socket()?;

    socket.send_to(&[0x0a, 0xff, 0x01], addr)?;
    assert!(recv_raw(&socket).is_none());

    let mut envelope = Envelope::seal(
        b"corrupt".to_vec(),
        protocol::encode_request(&Request::put("x", "y", 0)),
    );
    envelope.checksum ^= 0xdead;
    socket.send_to(&envelope.encode_to_vec(), addr)?;
    assert!(recv_raw(&socket).is_none());
    assert!(server.store().get(b"x").is_none());

    // The loop is still serving afterwards.
    assert_eq!(client(addr)?.get(b"x")?.code(), Some(ErrorCode::NonExistentKey));

    server.stop();
    Ok(())
}

#[test]
fn reply_envelope_is_checksummed() -> Result<()> {
    let (mut server, addr) = spawn_server(DispatcherKind::Inline)?;
    let socket = raw_socket()?;

    let datagram = protocol::encode_envelope(
        b"check",
        &protocol::encode_request(&Request::new(Command::IsAlive)),
    );
    socket.send_to(&datagram, addr)?;
    let reply = protocol::decode_envelope(&recv_raw(&socket).expect("reply"))?;

    assert_eq!(reply.message_id, b"check");
    assert_eq!(
        reply.checksum,
        u64::from(protocol::checksum(&reply.message_id, &reply.payload))
    );
    assert_eq!(protocol::decode_response(&reply.payload)?, Response::ok());

    server.stop();
    Ok(())
}

#[test]
fn validation_and_unknown_commands_over_the_wire() -> Result<()> {
    let (mut server, addr) = spawn_server(DispatcherKind::Pooled)?;
    let client = client(addr)?;

    assert_eq!(client.put(b"", b"v", 0)?.code(), Some(ErrorCode::InvalidKey));
    assert_eq!(client.put(&[b'k'; 33], b"v", 0)?.code(), Some(ErrorCode::InvalidKey));
    assert_eq!(client.put(b"k", b"", 0)?.code(), Some(ErrorCode::InvalidValue));
    assert_eq!(
        client.put(b"k", &vec![0u8; 10_001], 0)?.code(),
        Some(ErrorCode::InvalidValue)
    );

    let mut unknown = Request::put("k", "v", 0);
    unknown.command = 0x99;
    assert_eq!(client.send(&unknown)?.code(), Some(ErrorCode::UnrecognizedCommand));
    assert!(server.store().is_empty());

    server.stop();
    Ok(())
}

#[test]
fn wipe_out_then_get_reports_missing() -> Result<()> {
    let (mut server, addr) = spawn_server(DispatcherKind::Pooled)?;
    let client = client(addr)?;

    for i in 0..10u8 {
        assert_eq!(client.put(&[b'k', i], &[i + 1], i32::from(i))?, Response::ok());
    }
    assert_eq!(client.send(&Request::new(Command::WipeOut))?, Response::ok());
    for i in 0..10u8 {
        assert_eq!(client.get(&[b'k', i])?.code(), Some(ErrorCode::NonExistentKey));
    }
    assert_eq!(server.store().used_bytes(), 0);

    server.stop();
    Ok(())
}

#[test]
fn concurrent_clients_are_all_served() -> Result<()> {
    let (mut server, addr) = spawn_server(DispatcherKind::Pooled)?;

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            thread::spawn(move || -> Result<()> {
                let client = client(addr)?;
                for i in 0..25u8 {
                    let key = [t, i];
                    assert_eq!(client.put(&key, &[i + 1], i32::from(i))?, Response::ok());
                    let got = client.get(&key)?;
                    assert_eq!(got.value, Some(vec![i + 1]));
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("client thread")?;
    }

    assert_eq!(server.store().len(), 100);
    server.stop();
    Ok(())
}

#[test]
fn every_channel_is_served_by_one_reactor() -> Result<()> {
    let loopback: SocketAddr = "127.0.0.1:0".parse()?;
    let config = ServerConfig {
        bind: vec![loopback, loopback],
        ..ServerConfig::default()
    };
    let mut server = Server::new(config)?;
    server.start()?;
    let addrs = server.local_addrs();
    assert_eq!(addrs.len(), 2);
    assert_ne!(addrs[0], addrs[1]);

    // Both channels share the same store.
    assert_eq!(client(addrs[0])?.put(b"shared", b"v", 7)?, Response::ok());
    let got = client(addrs[1])?.get(b"shared")?;
    assert_eq!(got.version, Some(7));

    server.stop();
    Ok(())
}

#[test]
fn stop_closes_the_socket() -> Result<()> {
    let (mut server, addr) = spawn_server(DispatcherKind::Pooled)?;
    server.stop();
    server.stop();

    // The port is free again once the reactor is gone.
    let rebound = UdpSocket::bind(addr);
    assert!(rebound.is_ok());
    Ok(())
}

#[test]
fn isolated_servers_do_not_share_state() -> Result<()> {
    let (mut first, first_addr) = spawn_server(DispatcherKind::Inline)?;
    let (mut second, second_addr) = spawn_server(DispatcherKind::Inline)?;
    let stores = [Arc::clone(first.store()), Arc::clone(second.store())];

    client(first_addr)?.put(b"only-here", b"v", 0)?;
    assert_eq!(
        client(second_addr)?.get(b"only-here")?.code(),
        Some(ErrorCode::NonExistentKey)
    );
    assert_eq!(stores[0].len(), 1);
    assert!(stores[1].is_empty());

    first.stop();
    second.stop();
    Ok(())
}
