use std::borrow::Cow;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

fn invalid_data(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// Read one newline-terminated command line into `buf`, stripping the `\n`
/// and an optional preceding `\r`.
///
/// Returns `Ok(None)` on clean EOF (nothing buffered). EOF in the middle of
/// a line is an error: the frame never completed. Frames split across reads
/// accumulate in the reader's buffer, so pipelined and fragmented input both
/// work without the caller doing anything.
pub async fn read_command_line<'a, R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &'a mut Vec<u8>,
    max_line_len: usize,
) -> std::io::Result<Option<&'a [u8]>> {
    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-command",
            ));
        }
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let take = pos + 1;
            if buf.len().saturating_add(take) > max_line_len.saturating_add(2) {
                return Err(invalid_data("command line too long"));
            }
            buf.extend_from_slice(&chunk[..take]);
            reader.consume(take);
            break;
        }
        if buf.len().saturating_add(chunk.len()) > max_line_len.saturating_add(2) {
            return Err(invalid_data("command line too long"));
        }
        let take = chunk.len();
        buf.extend_from_slice(chunk);
        reader.consume(take);
    }
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    if buf.len() > max_line_len {
        return Err(invalid_data("command line too long"));
    }
    Ok(Some(buf.as_slice()))
}

/// Split a command line on ASCII whitespace. Keys and values containing
/// whitespace are unrepresentable in this framing, so a plain split is the
/// whole tokenizer.
pub fn tokenize(line: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < line.len() {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            break;
        }
        let start = i;
        while i < line.len() && !line[i].is_ascii_whitespace() {
            i += 1;
        }
        out.push(String::from_utf8_lossy(&line[start..i]).into_owned());
    }
    out
}

// ── Reply builders ────────────────────────────────────────────────────────────

pub fn resp_ok() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"+OK\r\n")
}

pub fn resp_simple(msg: &str) -> Cow<'static, [u8]> {
    Cow::Owned(format!("+{msg}\r\n").into_bytes())
}

pub fn resp_err(msg: &str) -> Cow<'static, [u8]> {
    Cow::Owned(format!("-ERR {msg}\r\n").into_bytes())
}

pub fn resp_int(n: i64) -> Cow<'static, [u8]> {
    Cow::Owned(format!(":{n}\r\n").into_bytes())
}

pub fn resp_null() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"$-1\r\n")
}

pub fn resp_bulk(data: &[u8]) -> Cow<'static, [u8]> {
    let mut out = Vec::with_capacity(data.len() + 16);
    out.push(b'$');
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    Cow::Owned(out)
}

pub fn wrong_args(verb: &str) -> Cow<'static, [u8]> {
    resp_err(&format!(
        "wrong number of arguments for '{}' command",
        verb.to_ascii_lowercase()
    ))
}

pub fn unknown_command(verb: &str) -> Cow<'static, [u8]> {
    resp_err(&format!("unknown command '{verb}'"))
}
