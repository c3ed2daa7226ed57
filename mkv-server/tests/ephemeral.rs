use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::BytesMut;

use mkv_common::{encode_command, MkvError, RespDecoder, RespValue, TargetResolver};
use mkv_server::{EphemeralResolver, EphemeralServer, ServerConfig};

fn roundtrip(stream: &mut TcpStream, args: &[&str]) -> RespValue {
    let mut frame = BytesMut::new();
    encode_command(args, &mut frame);
    stream.write_all(&frame).expect("write");
    read_frame(stream)
}

fn read_frame(stream: &mut TcpStream) -> RespValue {
    let decoder = RespDecoder::default();
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 512];
    loop {
        if let Some(value) = decoder.decode(&mut buf).expect("decode") {
            return value;
        }
        let n = stream.read(&mut chunk).expect("read");
        assert!(n > 0, "server closed the connection");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn dial(server: &EphemeralServer) -> TcpStream {
    let stream = TcpStream::connect(server.addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    stream
}

#[test]
fn serves_resp_clients() {
    let server = EphemeralServer::start().expect("start");
    let mut stream = dial(&server);

    assert_eq!(roundtrip(&mut stream, &["PING"]), RespValue::Simple("PONG".to_string()));
    assert_eq!(
        roundtrip(&mut stream, &["SET", "k", "v"]),
        RespValue::Simple("OK".to_string())
    );
    assert_eq!(roundtrip(&mut stream, &["GET", "k"]), RespValue::bulk("v"));
    assert_eq!(roundtrip(&mut stream, &["SETEX", "t", "10", "x"]), RespValue::Simple("OK".to_string()));
    assert_eq!(roundtrip(&mut stream, &["TTL", "t"]), RespValue::Integer(10));
    assert_eq!(roundtrip(&mut stream, &["EXISTS", "k", "t", "nope"]), RespValue::Integer(2));
    assert_eq!(server.state().store.len(), 2);
}

#[test]
fn subscribed_connection_receives_published_messages() {
    let server = EphemeralServer::start().expect("start");
    let mut subscriber = dial(&server);
    let mut publisher = dial(&server);

    let ack = roundtrip(&mut subscriber, &["SUBSCRIBE", "chat"]);
    assert_eq!(
        ack,
        RespValue::array(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk("chat"),
            RespValue::Integer(1),
        ])
    );
    assert_eq!(roundtrip(&mut publisher, &["PUBLISH", "chat", "hi"]), RespValue::Integer(1));

    let pushed = read_frame(&mut subscriber);
    assert_eq!(
        pushed,
        RespValue::array(vec![
            RespValue::bulk("message"),
            RespValue::bulk("chat"),
            RespValue::bulk("hi"),
        ])
    );
}

#[test]
fn values_expire() {
    let server = EphemeralServer::with_config(ServerConfig {
        expire_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    })
    .expect("start");
    let mut stream = dial(&server);

    roundtrip(&mut stream, &["SET", "gone", "soon", "EX", "1"]);
    std::thread::sleep(Duration::from_millis(1300));
    assert_eq!(roundtrip(&mut stream, &["GET", "gone"]), RespValue::Bulk(None));
    assert!(server.state().store.is_empty());
}

#[test]
fn shutdown_is_idempotent() {
    let mut server = EphemeralServer::start().expect("start");
    let addr = server.addr();
    assert!(server.is_running());
    server.shutdown();
    server.shutdown();
    assert!(!server.is_running());
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn resolver_points_at_instance_until_teardown() {
    let resolver = EphemeralResolver::start().expect("start");
    let target = resolver.resolve().expect("resolve");
    assert_eq!(target.scheme(), "redis");
    assert_eq!(target.host(), "127.0.0.1");

    let mut stream = TcpStream::connect(target.socket_addr()).expect("connect");
    assert_eq!(roundtrip(&mut stream, &["PING"]), RespValue::Simple("PONG".to_string()));

    resolver.teardown();
    resolver.teardown();
    assert!(!resolver.is_provisioned());
    assert!(matches!(resolver.resolve(), Err(MkvError::UnavailableTarget(_))));
}

#[test]
fn bind_failure_is_unavailable() {
    let err = EphemeralServer::with_config(ServerConfig {
        bind: "256.0.0.1:0".to_string(),
        ..ServerConfig::default()
    })
    .err()
    .expect("bind must fail");
    assert!(matches!(err, MkvError::UnavailableTarget(_)));
}
