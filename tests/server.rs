//! End-to-end wire tests: a real listener, real sockets, exact reply bytes.

use std::net::SocketAddr;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use redis_clone::config::Config;
use redis_clone::server::{self, ServerCtx};

async fn start_server() -> (SocketAddr, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        data_dir: dir.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    let ctx = ServerCtx::new(&config);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(server::serve(listener, ctx));
    (addr, dir)
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

async fn expect_reply(stream: &mut TcpStream, cmd: &str, expected: &[u8]) {
    stream.write_all(cmd.as_bytes()).await.expect("write");
    let mut buf = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .expect("read");
    assert_eq!(buf, expected, "reply to {cmd:?}");
}

#[tokio::test]
async fn set_get_exists_del_cycle() {
    let (addr, _dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(&mut conn, "SET foo bar\n", b"+OK\r\n").await;
    expect_reply(&mut conn, "GET foo\n", b"$3\r\nbar\r\n").await;
    expect_reply(&mut conn, "EXISTS foo\n", b":1\r\n").await;
    expect_reply(&mut conn, "DEL foo\n", b":1\r\n").await;
    expect_reply(&mut conn, "GET foo\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn get_missing_key_returns_null_bulk() {
    let (addr, _dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(&mut conn, "GET missing\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn set_without_value_is_an_arity_error() {
    let (addr, _dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(
        &mut conn,
        "SET a\n",
        b"-ERR wrong number of arguments for 'set' command\r\n",
    )
    .await;
}

#[tokio::test]
async fn unknown_command_reports_error() {
    let (addr, _dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(&mut conn, "FOO x y\n", b"-ERR unknown command 'FOO'\r\n").await;
}

#[tokio::test]
async fn pipelined_commands_reply_in_order() {
    let (addr, _dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(
        &mut conn,
        "SET k1 v1\r\nSET k2 v2\r\nGET k1\r\n",
        b"+OK\r\n+OK\r\n$2\r\nv1\r\n",
    )
    .await;
}

#[tokio::test]
async fn state_is_shared_across_connections() {
    let (addr, _dir) = start_server().await;
    let mut writer_conn = connect(addr).await;
    expect_reply(&mut writer_conn, "SET shared 1\n", b"+OK\r\n").await;

    let mut reader_conn = connect(addr).await;
    expect_reply(&mut reader_conn, "GET shared\n", b"$1\r\n1\r\n").await;
}

#[tokio::test]
async fn quit_replies_ok_then_server_closes() {
    let (addr, _dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(&mut conn, "QUIT\n", b"+OK\r\n").await;

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut rest))
        .await
        .expect("timed out waiting for close")
        .expect("read");
    assert_eq!(n, 0, "server should close without sending more");
}

#[tokio::test]
async fn bgsave_writes_a_snapshot() {
    let (addr, dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(&mut conn, "SET persisted yes\n", b"+OK\r\n").await;
    expect_reply(&mut conn, "BGSAVE\n", b"+Background saving started\r\n").await;

    let snapshot = dir.path().join("dump.json");
    for _ in 0..500 {
        if snapshot.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("snapshot was never written");
}

#[tokio::test]
async fn blank_lines_are_ignored() {
    let (addr, _dir) = start_server().await;
    let mut conn = connect(addr).await;
    expect_reply(&mut conn, "\r\n\nSET k v\n", b"+OK\r\n").await;
}
