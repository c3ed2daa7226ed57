use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;

use mkv_client::{ClientConfig, Connection, ConnectionTarget, MkvError, TtlStatus};

/// Scripted RESP server: answers the PING handshake, then hands each of the
/// next `expected_commands` commands to `handler` and forwards a copy to the
/// returned receiver.
fn spawn_server(
    expected_commands: usize,
    handler: fn(usize, &[Vec<u8>], &mut TcpStream),
) -> (SocketAddr, mpsc::Receiver<Vec<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (seen_tx, seen_rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));

        let hello = read_command(&mut reader).expect("read handshake");
        assert_eq!(hello, vec![b"PING".to_vec()]);
        write_simple(&mut stream, "PONG");

        for idx in 0..expected_commands {
            let args = read_command(&mut reader).expect("read command");
            handler(idx, &args, &mut stream);
            let _ = seen_tx.send(args);
        }
    });

    (addr, seen_rx)
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"))
}

fn write_raw(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(data);
    let _ = stream.flush();
}

fn write_simple(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("+{msg}\r\n").as_bytes());
}

fn write_error(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("-{msg}\r\n").as_bytes());
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let mut frame = format!("${}\r\n", data.len()).into_bytes();
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    write_raw(stream, &frame);
}

fn write_integer(stream: &mut TcpStream, value: i64) {
    write_raw(stream, format!(":{value}\r\n").as_bytes());
}

fn connect(addr: SocketAddr) -> Connection {
    let target = ConnectionTarget::new(addr.ip().to_string(), addr.port()).expect("target");
    let config = ClientConfig {
        connect_timeout: Some(Duration::from_secs(1)),
        ..ClientConfig::default()
    };
    Connection::connect(&target, config).expect("connect")
}

fn strings(args: &[Vec<u8>]) -> Vec<String> {
    args.iter().map(|arg| String::from_utf8_lossy(arg).into_owned()).collect()
}

#[test]
fn set_get_roundtrip() {
    let (addr, seen) = spawn_server(2, |idx, _, stream| {
        if idx == 0 {
            write_simple(stream, "OK");
        } else {
            write_bulk(stream, b"value");
        }
    });

    let conn = connect(addr);
    assert_eq!(conn.sync().set("key", "value").expect("set"), "OK");
    assert_eq!(conn.sync().get("key").expect("get"), Some("value".to_string()));

    assert_eq!(strings(&seen.recv().unwrap()), vec!["SET", "key", "value"]);
    assert_eq!(strings(&seen.recv().unwrap()), vec!["GET", "key"]);
    conn.close();
}

#[test]
fn setex_is_identical_in_every_form() {
    let (addr, seen) = spawn_server(3, |_, _, stream| write_simple(stream, "OK"));
    let conn = connect(addr);

    conn.sync().set_with_expiry("session", "token", 5).expect("sync");
    block_on(conn.asynchronous().set_with_expiry("session", "token", 5).expect("async")).expect("async reply");
    block_on(conn.reactive().set_with_expiry("session", "token", 5).expect("reactive").single()).expect("reactive reply");

    let expected = vec!["SETEX", "session", "5", "token"];
    for _ in 0..3 {
        assert_eq!(strings(&seen.recv().unwrap()), expected);
    }
    conn.close();
}

#[test]
fn ttl_sentinels() {
    let (addr, _seen) = spawn_server(3, |idx, _, stream| {
        let value = [-2, -1, 5][idx];
        write_integer(stream, value);
    });

    let conn = connect(addr);
    let sync = conn.sync();
    assert_eq!(sync.ttl("missing").expect("ttl"), TtlStatus::Missing);
    assert_eq!(sync.ttl("forever").expect("ttl"), TtlStatus::NoExpiry);
    assert_eq!(sync.ttl("soon").expect("ttl"), TtlStatus::ExpiresIn(Duration::from_secs(5)));
    conn.close();
}

#[test]
fn hash_fields_on_the_wire() {
    let (addr, seen) = spawn_server(2, |idx, _, stream| {
        if idx == 0 {
            write_integer(stream, 1);
        } else {
            write_raw(stream, b"*2\r\n$4\r\nname\r\n$3\r\nAda\r\n");
        }
    });

    let conn = connect(addr);
    let mut fields = HashMap::new();
    fields.insert("name".to_string(), "Ada".to_string());
    assert_eq!(conn.sync().set_hash_fields("user:1", &fields).expect("hset"), 1);
    assert_eq!(conn.sync().get_hash_fields("user:1").expect("hgetall"), fields);

    assert_eq!(strings(&seen.recv().unwrap()), vec!["HSET", "user:1", "name", "Ada"]);
    assert_eq!(strings(&seen.recv().unwrap()), vec!["HGETALL", "user:1"]);
    conn.close();
}

#[test]
fn invalid_arguments_never_reach_the_wire() {
    let (addr, seen) = spawn_server(1, |_, _, stream| write_integer(stream, 0));
    let conn = connect(addr);

    assert!(conn.sync().set_with_expiry("k", "v", 0).unwrap_err().is_invalid_argument());
    assert!(conn.asynchronous().set_with_expiry("k", "v", 0).err().unwrap().is_invalid_argument());
    assert!(conn.reactive().set_with_expiry("k", "v", 0).err().unwrap().is_invalid_argument());
    assert!(conn.sync().set_hash_fields("k", &HashMap::new()).unwrap_err().is_invalid_argument());

    // The first command the server sees is the one issued afterwards.
    assert!(!conn.sync().exists("k").expect("exists"));
    assert_eq!(strings(&seen.recv().unwrap()), vec!["EXISTS", "k"]);
    conn.close();
}

#[test]
fn error_reply_maps_to_command_error() {
    let (addr, _seen) = spawn_server(1, |_, _, stream| {
        write_error(stream, "WRONGTYPE Operation against a key holding the wrong kind of value");
    });

    let conn = connect(addr);
    let err = conn.sync().get("hash").unwrap_err();
    assert!(matches!(err, MkvError::Command(message) if message.starts_with("WRONGTYPE")));
    conn.close();
}

#[test]
fn pipelined_replies_complete_in_order() {
    let (addr, _seen) = spawn_server(3, |_, args, stream| write_bulk(stream, &args[1]));

    let conn = connect(addr);
    let commands = conn.asynchronous();
    let first = commands.get("a").expect("get a");
    let second = commands.get("b").expect("get b");
    let third = commands.get("c").expect("get c");
    assert!(first.command_id() < second.command_id());
    assert!(second.command_id() < third.command_id());

    assert_eq!(block_on(third).expect("c"), Some("c".to_string()));
    assert_eq!(block_on(first).expect("a"), Some("a".to_string()));
    assert_eq!(block_on(second).expect("b"), Some("b".to_string()));
    conn.close();
}

#[test]
fn failed_handshake_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        let _ = read_command(&mut reader);
        write_error(&mut stream, "NOAUTH Authentication required.");
    });

    let target = ConnectionTarget::new(addr.ip().to_string(), addr.port()).expect("target");
    let err = Connection::connect(&target, ClientConfig::default()).unwrap_err();
    assert!(matches!(err, MkvError::Connection { .. }), "unexpected error: {err:?}");
}

#[test]
fn refused_connection_is_a_connection_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    };

    let target = ConnectionTarget::new(addr.ip().to_string(), addr.port()).expect("target");
    let err = Connection::connect(&target, ClientConfig::default()).unwrap_err();
    assert!(matches!(err, MkvError::Connection { ref addr, .. } if addr.ends_with(&target.port().to_string())));
}

#[test]
fn transport_failure_fails_pending_and_closes() {
    // Read the command, then hang up without replying.
    let (addr, _seen) = spawn_server(1, |_, _, stream| {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    });

    let conn = connect(addr);
    let err = conn.sync().get("key").unwrap_err();
    assert!(matches!(err, MkvError::Io(_)), "unexpected error: {err:?}");

    let err = conn.sync().get("key").unwrap_err();
    assert!(err.is_connection_closed(), "unexpected error: {err:?}");
    conn.close();
}
