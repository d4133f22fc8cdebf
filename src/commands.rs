use std::borrow::Cow;
use std::time::Instant;

use tracing::debug;

use crate::persist::Persistence;
use crate::resp::{
    resp_bulk, resp_err, resp_int, resp_null, resp_ok, resp_simple, tokenize, unknown_command,
    wrong_args,
};
use crate::store::Store;

/// A parsed command line: uppercased verb plus up to two arguments.
/// Tokens beyond the third are ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub verb: String,
    pub key: Option<String>,
    pub value: Option<String>,
}

impl Request {
    /// Parse a command line. Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = tokenize(line.as_bytes()).into_iter();
        let verb = tokens.next()?.to_ascii_uppercase();
        let key = tokens.next();
        let value = tokens.next();
        Some(Self { verb, key, value })
    }

    /// Inverse of [`parse`](Self::parse) for whitespace-free parts.
    pub fn format(&self) -> String {
        match (&self.key, &self.value) {
            (Some(key), Some(value)) => format!("{} {} {}", self.verb, key, value),
            (Some(key), None) => format!("{} {}", self.verb, key),
            _ => self.verb.clone(),
        }
    }
}

/// Dispatch one command line. Returns the reply bytes and whether the
/// connection should close once the reply has drained.
pub async fn dispatch(
    line: &str,
    store: &Store,
    persist: &Persistence,
) -> (Cow<'static, [u8]>, bool) {
    let Some(req) = Request::parse(line) else {
        return (resp_err("empty command"), false);
    };
    let start = Instant::now();
    let reply = match req.verb.as_str() {
        "SET" => cmd_set(&req, line, store, persist).await,
        "GET" => cmd_get(&req, store).await,
        "DEL" => cmd_del(&req, line, store, persist).await,
        "EXISTS" => cmd_exists(&req, store).await,
        "QUIT" => return (resp_ok(), true),
        "BGSAVE" => cmd_bgsave(store, persist).await,
        "BGREWRITEAOF" => cmd_bgrewriteaof(store, persist).await,
        _ => unknown_command(&req.verb),
    };
    let verb_label = match req.verb.as_str() {
        "SET" => "set",
        "GET" => "get",
        "DEL" => "del",
        "EXISTS" => "exists",
        "BGSAVE" => "bgsave",
        "BGREWRITEAOF" => "bgrewriteaof",
        _ => "unknown",
    };
    metrics::counter!("redis_clone_commands_total", "command" => verb_label).increment(1);
    metrics::histogram!("redis_clone_command_duration_seconds", "command" => verb_label)
        .record(start.elapsed().as_secs_f64());
    (reply, false)
}

/// Kick off an automatic rewrite when the append-time check fired.
async fn maybe_start_rewrite(store: &Store, persist: &Persistence) {
    if let Err(reason) = persist.start_background_rewrite(store).await {
        debug!(reason, "automatic AOF rewrite not started");
    }
}

async fn cmd_set(
    req: &Request,
    line: &str,
    store: &Store,
    persist: &Persistence,
) -> Cow<'static, [u8]> {
    let (Some(key), Some(value)) = (&req.key, &req.value) else {
        return wrong_args(&req.verb);
    };
    store.write().await.set(key.clone(), value.clone());
    debug!(key = %key, "SET");
    // The append happens before the reply is enqueued.
    if persist.record_mutation(line) {
        maybe_start_rewrite(store, persist).await;
    }
    resp_ok()
}

async fn cmd_get(req: &Request, store: &Store) -> Cow<'static, [u8]> {
    let Some(key) = &req.key else {
        return wrong_args(&req.verb);
    };
    match store.read().await.get(key) {
        Some(value) => resp_bulk(value.as_bytes()),
        None => resp_null(),
    }
}

async fn cmd_del(
    req: &Request,
    line: &str,
    store: &Store,
    persist: &Persistence,
) -> Cow<'static, [u8]> {
    let Some(key) = &req.key else {
        return wrong_args(&req.verb);
    };
    let removed = store.write().await.del(key);
    debug!(key = %key, removed, "DEL");
    if removed && persist.record_mutation(line) {
        maybe_start_rewrite(store, persist).await;
    }
    resp_int(i64::from(removed))
}

async fn cmd_exists(req: &Request, store: &Store) -> Cow<'static, [u8]> {
    let Some(key) = &req.key else {
        return wrong_args(&req.verb);
    };
    resp_int(i64::from(store.read().await.exists(key)))
}

async fn cmd_bgsave(store: &Store, persist: &Persistence) -> Cow<'static, [u8]> {
    match persist.start_background_save(store).await {
        Ok(()) => resp_simple("Background saving started"),
        Err(reason) => resp_err(reason),
    }
}

async fn cmd_bgrewriteaof(store: &Store, persist: &Persistence) -> Cow<'static, [u8]> {
    match persist.start_background_rewrite(store).await {
        Ok(()) => resp_simple("Background AOF rewrite started"),
        Err(reason) => resp_err(reason),
    }
}
