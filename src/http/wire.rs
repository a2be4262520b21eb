//! Minimal HTTP/1.1 framing for the tunnel: keep-alive request/response exchanges
//!  with `application/octet-stream` bodies and explicit `Content-Length`. Only the
//!  subset the tunnel needs is implemented, with hard bounds on head size so a
//!  misbehaving peer cannot balloon memory.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelResult};

/// Path every tunnel request is posted to.
pub const TUNNEL_PATH: &str = "/conduit/tunnel";
pub const USER_AGENT: &str = "ConduitTunnel/1.0";

const MAX_HEAD_LINE: usize = 4 * 1024;
const MAX_HEAD_LINES: usize = 64;

/// Status of a response head, mapped from the status line.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResponseStatus {
    Ok,
    Continue,
    Conflict,
    Other(u16),
}

/// A parsed request or response head: the start line plus lowercased header names.
#[derive(Debug)]
pub struct Head {
    pub start_line: String,
    headers: Vec<(String, String)>,
}

impl Head {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> ChannelResult<usize> {
        let raw = self.header("content-length")
            .ok_or_else(|| ChannelError::incorrect_data("missing Content-Length"))?;
        raw.parse::<usize>()
            .map_err(|_| ChannelError::IncorrectData {
                detail: format!("invalid Content-Length '{}'", raw),
            })
    }

    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    /// Status code of a response start line (`HTTP/1.1 200 OK`).
    pub fn response_status(&self) -> ChannelResult<ResponseStatus> {
        let code = self.start_line
            .split_ascii_whitespace()
            .nth(1)
            .and_then(|raw| raw.parse::<u16>().ok())
            .ok_or_else(|| ChannelError::IncorrectData {
                detail: format!("malformed status line '{}'", self.start_line),
            })?;

        Ok(match code {
            100 => ResponseStatus::Continue,
            200 => ResponseStatus::Ok,
            409 => ResponseStatus::Conflict,
            other => ResponseStatus::Other(other),
        })
    }

    pub fn is_post_to_tunnel(&self) -> bool {
        let mut parts = self.start_line.split_ascii_whitespace();
        parts.next() == Some("POST") && parts.next() == Some(TUNNEL_PATH)
    }
}

/// Read one head (start line plus headers up to the blank line), enforcing the line
///  and count bounds.
pub async fn read_head<R>(
    reader: &mut BufReader<R>,
    deadline: Deadline,
) -> ChannelResult<Head>
where
    R: tokio::io::AsyncRead + Unpin,
{
    deadline.check("read http head")?;
    deadline
        .run("read http head", async {
            let start_line = read_head_line(reader).await?;
            if start_line.is_empty() {
                return Err(ChannelError::incorrect_data("empty http start line"));
            }

            let mut headers = Vec::new();
            loop {
                if headers.len() >= MAX_HEAD_LINES {
                    return Err(ChannelError::incorrect_data("too many http headers"));
                }
                let line = read_head_line(reader).await?;
                if line.is_empty() {
                    break;
                }

                let (name, value) = line.split_once(':')
                    .ok_or_else(|| ChannelError::IncorrectData {
                        detail: format!("malformed http header '{}'", line),
                    })?;
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }

            trace!("read http head '{}' with {} headers", start_line, headers.len());
            Ok(Head {
                start_line,
                headers,
            })
        })
        .await
}

async fn read_head_line<R>(reader: &mut BufReader<R>) -> ChannelResult<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take((MAX_HEAD_LINE + 1) as u64);
    let n = limited.read_until(b'\n', &mut line).await
        .map_err(|e| ChannelError::from_io("read http head", e))?;
    if n == 0 {
        return Err(ChannelError::closed("peer closed the socket mid-head"));
    }
    if line.len() > MAX_HEAD_LINE {
        return Err(ChannelError::incorrect_data("http head line exceeds the bound"));
    }

    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| ChannelError::incorrect_data("http head is not valid UTF-8"))
}

/// Read exactly `len` body bytes.
pub async fn read_body<R>(
    reader: &mut BufReader<R>,
    len: usize,
    max_len: usize,
    deadline: Deadline,
) -> ChannelResult<Bytes>
where
    R: tokio::io::AsyncRead + Unpin,
{
    if len > max_len {
        return Err(ChannelError::TooLarge {
            size: len,
            limit: max_len,
        });
    }

    deadline
        .run("read http body", async {
            let mut body = BytesMut::zeroed(len);
            reader.read_exact(&mut body).await
                .map_err(|e| ChannelError::from_io("read http body", e))?;
            Ok(body.freeze())
        })
        .await
}

/// Write a tunnel request head. `expect_continue` asks for an interim response
///  before the body is committed, used for bodies beyond the recommended size.
pub async fn write_request_head<W>(
    writer: &mut W,
    host: &str,
    content_length: usize,
    expect_continue: bool,
) -> ChannelResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Content-Type: application/octet-stream\r\n\
         Accept: application/octet-stream\r\n\
         Connection: Keep-Alive\r\n\
         Content-Length: {}\r\n",
        TUNNEL_PATH, host, USER_AGENT, content_length,
    );
    if expect_continue {
        head.push_str("Expect: 100-continue\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await
        .map_err(|e| ChannelError::from_io("write http request", e))
}

pub async fn write_response_head<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    content_length: usize,
) -> ChannelResult<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/octet-stream\r\n\
         Connection: Keep-Alive\r\n\
         Content-Length: {}\r\n\r\n",
        status, reason, content_length,
    );
    writer.write_all(head.as_bytes()).await
        .map_err(|e| ChannelError::from_io("write http response", e))
}

/// The interim response consumed by a client that sent `Expect: 100-continue`.
pub async fn write_continue<W>(writer: &mut W) -> ChannelResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await
        .map_err(|e| ChannelError::from_io("write http interim response", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::*;
    use std::time::Duration;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[rstest]
    fn test_parse_request_head() {
        rt().block_on(async {
            let raw = b"POST /conduit/tunnel HTTP/1.1\r\n\
                        Host: example\r\n\
                        Content-Length: 42\r\n\
                        Expect: 100-continue\r\n\
                        \r\n";
            let mut reader = BufReader::new(&raw[..]);
            let head = read_head(&mut reader, deadline()).await.unwrap();

            assert!(head.is_post_to_tunnel());
            assert_eq!(head.content_length().unwrap(), 42);
            assert!(head.expects_continue());
            assert_eq!(head.header("host"), Some("example"));
            assert_eq!(head.header("HOST"), Some("example"));
        });
    }

    #[rstest]
    #[case::ok("HTTP/1.1 200 OK", ResponseStatus::Ok)]
    #[case::interim("HTTP/1.1 100 Continue", ResponseStatus::Continue)]
    #[case::conflict("HTTP/1.1 409 Conflict", ResponseStatus::Conflict)]
    #[case::server_error("HTTP/1.1 500 Internal Server Error", ResponseStatus::Other(500))]
    fn test_response_status(#[case] start_line: &str, #[case] expected: ResponseStatus) {
        rt().block_on(async {
            let raw = format!("{}\r\nContent-Length: 0\r\n\r\n", start_line);
            let mut reader = BufReader::new(raw.as_bytes());
            let head = read_head(&mut reader, deadline()).await.unwrap();
            assert_eq!(head.response_status().unwrap(), expected);
        });
    }

    #[rstest]
    fn test_head_line_bound_enforced() {
        rt().block_on(async {
            let mut raw = b"POST /conduit/tunnel HTTP/1.1\r\nX-Padding: ".to_vec();
            raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_LINE + 1));
            raw.extend_from_slice(b"\r\n\r\n");

            let mut reader = BufReader::new(&raw[..]);
            let err = read_head(&mut reader, deadline()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IncorrectData);
        });
    }

    #[rstest]
    fn test_missing_content_length() {
        rt().block_on(async {
            let raw = b"POST /conduit/tunnel HTTP/1.1\r\nHost: x\r\n\r\n";
            let mut reader = BufReader::new(&raw[..]);
            let head = read_head(&mut reader, deadline()).await.unwrap();
            assert_eq!(head.content_length().unwrap_err().kind(), ErrorKind::IncorrectData);
        });
    }

    #[rstest]
    fn test_truncated_head_reports_close() {
        rt().block_on(async {
            let raw = b"POST /conduit/tunnel HTTP/1.1\r\nHost: x\r\n";
            let mut reader = BufReader::new(&raw[..]);
            let err = read_head(&mut reader, deadline()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        });
    }

    #[rstest]
    fn test_body_roundtrip_after_head() {
        rt().block_on(async {
            let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
            let mut reader = BufReader::new(&raw[..]);
            let head = read_head(&mut reader, deadline()).await.unwrap();
            let body = read_body(&mut reader, head.content_length().unwrap(), 1024, deadline())
                .await.unwrap();
            assert_eq!(body.as_ref(), b"hello");
        });
    }

    #[rstest]
    fn test_body_beyond_limit_rejected() {
        rt().block_on(async {
            let raw = b"hello";
            let mut reader = BufReader::new(&raw[..]);
            let err = read_body(&mut reader, 5, 4, deadline()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TooLarge);
        });
    }

    #[rstest]
    fn test_request_head_written_form() {
        rt().block_on(async {
            let mut out = Vec::new();
            write_request_head(&mut out, "peer:8737", 10, true).await.unwrap();
            let text = String::from_utf8(out).unwrap();

            assert!(text.starts_with("POST /conduit/tunnel HTTP/1.1\r\n"));
            assert!(text.contains("Content-Length: 10\r\n"));
            assert!(text.contains("Expect: 100-continue\r\n"));
            assert!(text.contains("Connection: Keep-Alive\r\n"));
            assert!(text.ends_with("\r\n\r\n"));
        });
    }
}
