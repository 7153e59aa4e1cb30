//! End to end scenarios against a scripted mock backend.
use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use postwire::{
    Config, ConnState, Connection, ErrorKind, ServerVersion, SslMode, TransactionStatus,
    protocol::backend::BackendMessage,
};

// ---- wire helpers, server side ----

fn put_msg(buf: &mut BytesMut, msgtype: u8, body: &[u8]) {
    buf.put_u8(msgtype);
    buf.put_i32(4 + body.len() as i32);
    buf.put_slice(body);
}

fn auth_ok(buf: &mut BytesMut) {
    put_msg(buf, b'R', &0u32.to_be_bytes());
}

fn backend_key_data(buf: &mut BytesMut, pid: u32, key: u32) {
    let mut body = Vec::new();
    body.extend_from_slice(&pid.to_be_bytes());
    body.extend_from_slice(&key.to_be_bytes());
    put_msg(buf, b'K', &body);
}

fn parameter_status(buf: &mut BytesMut, name: &str, value: &str) {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    put_msg(buf, b'S', &body);
}

fn ready_for_query(buf: &mut BytesMut, status: u8) {
    put_msg(buf, b'Z', &[status]);
}

fn row_description(buf: &mut BytesMut, columns: &[&str]) {
    let mut body = Vec::new();
    body.extend_from_slice(&(columns.len() as u16).to_be_bytes());
    for name in columns {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0u32.to_be_bytes()); // table oid
        body.extend_from_slice(&0u16.to_be_bytes()); // attribute number
        body.extend_from_slice(&23u32.to_be_bytes()); // int4
        body.extend_from_slice(&4u16.to_be_bytes()); // type size
        body.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        body.extend_from_slice(&0u16.to_be_bytes()); // text format
    }
    put_msg(buf, b'T', &body);
}

fn data_row(buf: &mut BytesMut, columns: &[&[u8]]) {
    let mut body = Vec::new();
    body.extend_from_slice(&(columns.len() as u16).to_be_bytes());
    for column in columns {
        body.extend_from_slice(&(column.len() as i32).to_be_bytes());
        body.extend_from_slice(column);
    }
    put_msg(buf, b'D', &body);
}

fn command_complete(buf: &mut BytesMut, tag: &str) {
    let mut body = Vec::from(tag.as_bytes());
    body.push(0);
    put_msg(buf, b'C', &body);
}

fn error_response(buf: &mut BytesMut, code: &str, message: &str) {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(b"ERROR\0");
    body.push(b'C');
    body.extend_from_slice(code.as_bytes());
    body.push(0);
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);
    put_msg(buf, b'E', &body);
}

fn notification(buf: &mut BytesMut, pid: u32, channel: &str, payload: &str) {
    let mut body = Vec::new();
    body.extend_from_slice(&pid.to_be_bytes());
    body.extend_from_slice(channel.as_bytes());
    body.push(0);
    body.extend_from_slice(payload.as_bytes());
    body.push(0);
    put_msg(buf, b'A', &body);
}

/// Read the startup packet (no message-type byte) and return its body.
async fn read_startup(stream: &mut TcpStream) -> Vec<u8> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let len = i32::from_be_bytes(len) as usize;
    let mut body = vec![0; len - 4];
    stream.read_exact(&mut body).await.unwrap();
    body
}

/// Read one regular frontend message.
async fn read_msg(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.unwrap();
    let len = i32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut body = vec![0; len - 4];
    stream.read_exact(&mut body).await.unwrap();
    (header[0], body)
}

async fn expect_query(stream: &mut TcpStream, sql: &str) {
    let (msgtype, body) = read_msg(stream).await;
    assert_eq!(msgtype, b'Q', "expected a simple query");
    let mut expected = Vec::from(sql.as_bytes());
    expected.push(0);
    assert_eq!(body, expected, "unexpected query text");
}

/// Accept the startup packet and bring the session to ReadyForQuery.
async fn serve_startup(stream: &mut TcpStream) {
    let startup = read_startup(stream).await;
    assert_eq!(&startup[..4], &196608i32.to_be_bytes(), "protocol version");

    let mut buf = BytesMut::new();
    auth_ok(&mut buf);
    backend_key_data(&mut buf, 42, 99);
    parameter_status(&mut buf, "server_version", "9.4.1");
    parameter_status(&mut buf, "standard_conforming_strings", "on");
    ready_for_query(&mut buf, b'I');
    stream.write_all(&buf).await.unwrap();
}

fn test_config(port: u16) -> Config {
    Config::new("127.0.0.1", "alice")
        .port(port)
        .password("secret")
        .database("app")
        .ssl_mode(SslMode::Disable)
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

// ---- scenarios ----

#[tokio::test]
async fn plaintext_startup_and_query() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;

        expect_query(&mut stream, "SELECT 1").await;
        let mut buf = BytesMut::new();
        row_description(&mut buf, &["?column?"]);
        data_row(&mut buf, &[&1i32.to_be_bytes()]);
        command_complete(&mut buf, "SELECT 1");
        ready_for_query(&mut buf, b'I');
        stream.write_all(&buf).await.unwrap();
        stream
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();
    assert!(conn.is_ready());
    assert!(!conn.is_secure());
    assert_eq!(conn.backend_process_id(), 42);
    assert_eq!(conn.backend_secret_key(), 99);
    assert_eq!(conn.server_version(), ServerVersion::new(9, 4, 1));
    assert!(conn.server_caps().supports_application_name);
    assert!(conn.server_caps().supports_discard);
    assert!(conn.server_caps().use_conformant_strings);
    assert_eq!(conn.parameter("server_version"), Some("9.4.1"));

    conn.query("SELECT 1").await.unwrap();
    assert_eq!(conn.state(), ConnState::Executing);

    let mut rows = 0;
    loop {
        match conn.recv().await.unwrap() {
            BackendMessage::RowDescription(desc) => assert_eq!(desc.field_len, 1),
            BackendMessage::DataRow(row) => {
                rows += 1;
                assert_eq!(row.column_len, 1);
            }
            BackendMessage::CommandComplete(done) => assert_eq!(&done.tag[..], b"SELECT 1"),
            BackendMessage::ReadyForQuery(_) => break,
            other => panic!("unexpected message {}", other.msgtype() as char),
        }
    }
    assert_eq!(rows, 1);
    assert!(conn.is_ready());

    server.await.unwrap();
}

#[tokio::test]
async fn ssl_required_but_refused() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        // first open: refuse, the client must give up
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut preamble = [0u8; 8];
        stream.read_exact(&mut preamble).await.unwrap();
        assert_eq!(preamble, [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
        stream.write_all(b"N").await.unwrap();
        drop(stream);

        // second open: refuse again, the client continues in plaintext
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut preamble = [0u8; 8];
        stream.read_exact(&mut preamble).await.unwrap();
        stream.write_all(b"N").await.unwrap();
        serve_startup(&mut stream).await;
        stream
    });

    let err = Connection::connect_with(test_config(port).ssl_mode(SslMode::Require))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Io(_)), "got {err:?}");

    let conn = Connection::connect_with(test_config(port).ssl_mode(SslMode::Prefer))
        .await
        .unwrap();
    assert!(conn.is_ready());
    assert!(!conn.is_secure());

    server.await.unwrap();
}

#[tokio::test]
async fn prepended_replies_are_invisible() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;

        // prepended setup must hit the wire first, in prepend order
        expect_query(&mut stream, "DISCARD ALL").await;
        expect_query(&mut stream, "BEGIN").await;
        expect_query(&mut stream, "SELECT 1").await;

        let mut buf = BytesMut::new();
        command_complete(&mut buf, "DISCARD ALL");
        ready_for_query(&mut buf, b'I');
        command_complete(&mut buf, "BEGIN");
        ready_for_query(&mut buf, b'T');
        row_description(&mut buf, &["?column?"]);
        data_row(&mut buf, &[&1i32.to_be_bytes()]);
        command_complete(&mut buf, "SELECT 1");
        ready_for_query(&mut buf, b'T');
        stream.write_all(&buf).await.unwrap();
        stream
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();

    conn.prepend_query("DISCARD ALL").unwrap();
    conn.prepend_query("BEGIN").unwrap();
    conn.mark_transaction_pending();
    conn.query("SELECT 1").await.unwrap();

    // the first two ReadyForQuery replies belong to the setup messages;
    // the first visible message is the user query's row description
    match conn.recv().await.unwrap() {
        BackendMessage::RowDescription(_) => {}
        other => panic!("drain leaked {}", other.msgtype() as char),
    }
    // the DISCARD ALL reply carried 'I' and must not have cleared Pending;
    // the BEGIN reply carried 'T'
    assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);

    loop {
        if let BackendMessage::ReadyForQuery(_) = conn.recv().await.unwrap() {
            break;
        }
    }
    assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);
    assert!(conn.is_ready());

    server.await.unwrap();
}

#[tokio::test]
async fn server_error_is_raised_at_ready_for_query() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;

        expect_query(&mut stream, "SELECT oops").await;
        let mut buf = BytesMut::new();
        error_response(&mut buf, "42601", "syntax error at or near \"oops\"");
        ready_for_query(&mut buf, b'I');
        stream.write_all(&buf).await.unwrap();

        // the session must recover for the next query
        expect_query(&mut stream, "SELECT 1").await;
        let mut buf = BytesMut::new();
        row_description(&mut buf, &["?column?"]);
        data_row(&mut buf, &[&1i32.to_be_bytes()]);
        command_complete(&mut buf, "SELECT 1");
        ready_for_query(&mut buf, b'I');
        stream.write_all(&buf).await.unwrap();
        stream
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();

    conn.query("SELECT oops").await.unwrap();
    let err = conn.recv().await.unwrap_err();
    match err.kind() {
        ErrorKind::Database(db) => {
            assert_eq!(db.code(), "42601");
            assert_eq!(db.severity(), "ERROR");
        }
        other => panic!("expected a database error, got {other:?}"),
    }
    assert!(conn.is_ready(), "a server error must not break the session");

    conn.query("SELECT 1").await.unwrap();
    loop {
        if let BackendMessage::ReadyForQuery(_) = conn.recv().await.unwrap() {
            break;
        }
    }

    server.await.unwrap();
}

#[tokio::test]
async fn cancel_uses_a_side_transport() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;
        expect_query(&mut stream, "SELECT pg_sleep(10)").await;

        // the cancel packet arrives on its own connection
        let (mut side, _) = listener.accept().await.unwrap();
        let mut packet = [0u8; 16];
        side.read_exact(&mut packet).await.unwrap();
        assert_eq!(&packet[..4], &16i32.to_be_bytes());
        assert_eq!(&packet[4..8], &80877102i32.to_be_bytes());
        assert_eq!(&packet[8..12], &42u32.to_be_bytes());
        assert_eq!(&packet[12..16], &99u32.to_be_bytes());
        // nothing else may follow
        let mut rest = [0u8; 1];
        assert_eq!(side.read(&mut rest).await.unwrap(), 0);

        stream
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();
    conn.query("SELECT pg_sleep(10)").await.unwrap();
    assert_eq!(conn.state(), ConnState::Executing);

    conn.cancel_request().await.unwrap();
    assert_eq!(conn.state(), ConnState::Executing, "cancel must not touch the state machine");

    server.await.unwrap();
}

#[tokio::test]
async fn reset_prepends_rollback_and_discard() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;

        expect_query(&mut stream, "ROLLBACK").await;
        expect_query(&mut stream, "DISCARD ALL").await;
        expect_query(&mut stream, "SELECT 1").await;

        let mut buf = BytesMut::new();
        command_complete(&mut buf, "ROLLBACK");
        ready_for_query(&mut buf, b'I');
        command_complete(&mut buf, "DISCARD ALL");
        ready_for_query(&mut buf, b'I');
        row_description(&mut buf, &["?column?"]);
        data_row(&mut buf, &[&1i32.to_be_bytes()]);
        command_complete(&mut buf, "SELECT 1");
        ready_for_query(&mut buf, b'I');
        stream.write_all(&buf).await.unwrap();
        stream
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();

    conn.mark_transaction_pending();
    conn.reset().unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    // nothing was flushed yet; the next operation carries the setup along
    conn.query("SELECT 1").await.unwrap();
    match conn.recv().await.unwrap() {
        BackendMessage::RowDescription(_) => {}
        other => panic!("drain leaked {}", other.msgtype() as char),
    }
    loop {
        if let BackendMessage::ReadyForQuery(_) = conn.recv().await.unwrap() {
            break;
        }
    }

    server.await.unwrap();
}

#[tokio::test]
async fn wrong_state_does_not_break() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;
        expect_query(&mut stream, "SELECT 1").await;
        stream
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();
    conn.query("SELECT 1").await.unwrap();

    let err = conn.query("SELECT 2").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(_)), "got {err:?}");
    assert_eq!(conn.state(), ConnState::Executing, "usage errors must not break");

    server.await.unwrap();
}

#[tokio::test]
async fn transport_failure_breaks_the_session() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;
        expect_query(&mut stream, "SELECT 1").await;
        // hang up mid-request
        drop(stream);
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();
    conn.query("SELECT 1").await.unwrap();

    let err = conn.recv().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Io(_)), "got {err:?}");
    assert_eq!(conn.state(), ConnState::Broken);

    let err = conn.recv().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(_)), "broken is terminal");

    server.await.unwrap();
}

#[tokio::test]
async fn copy_in_round_trip() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;

        expect_query(&mut stream, "COPY t FROM STDIN").await;
        let mut buf = BytesMut::new();
        // text format, one column
        let mut body = vec![0u8];
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        put_msg(&mut buf, b'G', &body);
        stream.write_all(&buf).await.unwrap();

        let (msgtype, body) = read_msg(&mut stream).await;
        assert_eq!(msgtype, b'd');
        assert_eq!(body, b"1\n");

        // the oversized chunk takes the direct write path, the frame is identical
        let (msgtype, body) = read_msg(&mut stream).await;
        assert_eq!(msgtype, b'd');
        assert_eq!(body.len(), 4096);
        assert!(body.iter().all(|b| *b == b'x'));

        let (msgtype, _) = read_msg(&mut stream).await;
        assert_eq!(msgtype, b'c');

        let mut buf = BytesMut::new();
        command_complete(&mut buf, "COPY 2");
        ready_for_query(&mut buf, b'I');
        stream.write_all(&buf).await.unwrap();
        stream
    });

    let mut conn = Connection::connect_with(test_config(port).buffer_size(1024))
        .await
        .unwrap();

    conn.query("COPY t FROM STDIN").await.unwrap();
    match conn.recv().await.unwrap() {
        BackendMessage::CopyInResponse(copy) => {
            assert_eq!(copy.format, 0);
            assert_eq!(copy.column_len, 1);
        }
        other => panic!("unexpected message {}", other.msgtype() as char),
    }
    assert_eq!(conn.state(), ConnState::Copy);

    conn.copy_data(b"1\n").await.unwrap();
    conn.copy_data(&vec![b'x'; 4096]).await.unwrap();
    conn.copy_done().await.unwrap();

    match conn.recv().await.unwrap() {
        BackendMessage::CommandComplete(done) => assert_eq!(&done.tag[..], b"COPY 2"),
        other => panic!("unexpected message {}", other.msgtype() as char),
    }
    match conn.recv().await.unwrap() {
        BackendMessage::ReadyForQuery(_) => {}
        other => panic!("unexpected message {}", other.msgtype() as char),
    }
    assert!(conn.is_ready());

    server.await.unwrap();
}

#[tokio::test]
async fn notifications_while_idle() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;

        let mut buf = BytesMut::new();
        notification(&mut buf, 7, "events", "hello");
        stream.write_all(&buf).await.unwrap();
        stream
    });

    let mut conn = Connection::connect_with(test_config(port)).await.unwrap();

    let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&seen);
    conn.on_notification(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let notification = conn.wait_notification().await.unwrap();
    assert_eq!(notification.process_id, 7);
    assert_eq!(notification.channel, "events");
    assert_eq!(notification.payload, "hello");
    assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(conn.is_ready());

    server.await.unwrap();
}

#[tokio::test]
async fn terminate_on_close() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_startup(&mut stream).await;

        let (msgtype, _) = read_msg(&mut stream).await;
        assert_eq!(msgtype, b'X', "expected Terminate");
        let mut rest = [0u8; 1];
        assert_eq!(stream.read(&mut rest).await.unwrap(), 0);
    });

    let conn = Connection::connect_with(test_config(port)).await.unwrap();
    conn.close().await.unwrap();

    server.await.unwrap();
}
