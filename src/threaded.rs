//! Thread-per-connection alternative to the event-loop server, kept behind
//! `--mode=threaded`. Shares the keyspace and the request codec with the
//! main mode; persistence is not wired up here.

use std::borrow::Cow;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use tracing::{debug, error, info};

use crate::commands::Request;
use crate::config::Config;
use crate::resp::{
    resp_bulk, resp_err, resp_int, resp_null, resp_ok, unknown_command, wrong_args,
};
use crate::store::Db;

pub fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr())
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    info!(addr = %config.listen_addr(), "threaded mode listening");

    let db = Arc::new(Mutex::new(Db::new()));
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let db = Arc::clone(&db);
                thread::spawn(move || handle_client(stream, db));
            }
            Err(e) => error!(error = %e, "accept error"),
        }
    }
    Ok(())
}

fn handle_client(mut stream: TcpStream, db: Arc<Mutex<Db>>) {
    let peer = stream.peer_addr().ok();
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to clone client stream");
            return;
        }
    };
    let mut reader = BufReader::new(reader_stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.strip_suffix('\n').unwrap_or(&line);
                let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
                if trimmed.is_empty() {
                    continue;
                }
                let (reply, quit) = process(trimmed, &db);
                if stream.write_all(&reply).is_err() {
                    break;
                }
                if quit {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "read error");
                break;
            }
        }
    }
    debug!(peer = ?peer, "connection closed");
}

fn process(line: &str, db: &Mutex<Db>) -> (Cow<'static, [u8]>, bool) {
    let Some(req) = Request::parse(line) else {
        return (resp_err("empty command"), false);
    };
    let mut db = db.lock().unwrap();
    let reply = match req.verb.as_str() {
        "SET" => match (&req.key, &req.value) {
            (Some(key), Some(value)) => {
                db.set(key.clone(), value.clone());
                resp_ok()
            }
            _ => wrong_args(&req.verb),
        },
        "GET" => match &req.key {
            Some(key) => match db.get(key) {
                Some(value) => resp_bulk(value.as_bytes()),
                None => resp_null(),
            },
            None => wrong_args(&req.verb),
        },
        "DEL" => match &req.key {
            Some(key) => resp_int(i64::from(db.del(key))),
            None => wrong_args(&req.verb),
        },
        "EXISTS" => match &req.key {
            Some(key) => resp_int(i64::from(db.exists(key))),
            None => wrong_args(&req.verb),
        },
        "QUIT" => return (resp_ok(), true),
        "BGSAVE" | "BGREWRITEAOF" => resp_err("persistence is not available in threaded mode"),
        _ => unknown_command(&req.verb),
    };
    (reply, false)
}
