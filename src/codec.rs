//! RESP3 wire codec: encode outbound command arrays, decode
//! inbound values, errors, attributes and streamed aggregates.

use crate::error::{RedisError, RedisResult};
use crate::monitor;
use crate::value::{Attributes, Pairs, PushKind, RedisValue, ValueKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, ReadBuf};

/// Writes one command (`*N\r\n` header + one `$len\r\n<bytes>\r\n` per
/// token) into `out`. A single flush per call composes one or more calls
/// into a single `write` at the connection layer.
pub fn encode_command(tokens: &[Vec<u8>], out: &mut Vec<u8>) {
    out.push(b'*');
    write_decimal(out, tokens.len() as i64);
    out.extend_from_slice(b"\r\n");
    for token in tokens {
        out.push(b'$');
        write_decimal(out, token.len() as i64);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(token);
        out.extend_from_slice(b"\r\n");
    }
}

/// Encodes a contiguous batch of commands into one buffer, the unit the
/// sender task flushes atomically.
pub fn encode_batch<'a>(commands: impl IntoIterator<Item = &'a [Vec<u8>]>, out: &mut Vec<u8>) {
    for tokens in commands {
        encode_command(tokens, out);
    }
}

fn write_decimal(out: &mut Vec<u8>, n: i64) {
    let mut buf = itoa::Buffer::new();
    out.extend_from_slice(buf.format(n).as_bytes());
}

/// Wraps a buffered reader and records every byte actually consumed through
/// it, so a `Decoder` built on top can hand a tracer the exact wire bytes
/// behind one decoded value rather than its parsed `Debug` rendering.
pub struct TeeReader<R> {
    inner: R,
    /// The bytes `poll_fill_buf` most recently handed back but that haven't
    /// been `consume`d yet; `consume(amt)` copies the first `amt` of these
    /// into `captured`, mirroring how much the caller actually used.
    pending: Vec<u8>,
    captured: Vec<u8>,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        TeeReader {
            inner,
            pending: Vec::new(),
            captured: Vec::new(),
        }
    }

    /// Drains and returns everything captured since the last call.
    pub fn take_captured(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.captured)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if res.is_ready() {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        res
    }
}

impl<R: AsyncBufRead + Unpin> AsyncBufRead for TeeReader<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_fill_buf(cx);
        if let Poll::Ready(Ok(bytes)) = &poll {
            this.pending = bytes.to_vec();
        }
        poll
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        if amt <= this.pending.len() {
            this.captured.extend_from_slice(&this.pending[..amt]);
        }
        Pin::new(&mut this.inner).consume(amt);
    }
}

/// Readers that can report the raw bytes consumed since the last call;
/// implemented by [`TeeReader`] and used by [`Decoder::decode_value_traced`].
pub trait CapturedBytes {
    fn take_captured(&mut self) -> Vec<u8>;
}

impl<R> CapturedBytes for TeeReader<R> {
    fn take_captured(&mut self) -> Vec<u8> {
        TeeReader::take_captured(self)
    }
}

/// A RESP3 decoder over any buffered async byte stream. Reads one
/// top-level value per call to `decode_value`, consuming exactly the bytes
/// of that value.
pub struct Decoder<R> {
    reader: R,
    line_buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin + Send> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Decoder {
            reader,
            line_buf: Vec::with_capacity(128),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Decodes exactly one top-level value, applying any attribute prefix
    /// and the monitor-notification relabeling at this level
    /// only: monitor notifications are always top-level replies.
    pub async fn decode_value(&mut self) -> RedisResult<RedisValue> {
        self.decode_inner(true).await
    }

    async fn read_line(&mut self) -> RedisResult<()> {
        self.line_buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.line_buf).await?;
        if n == 0 {
            return Err(RedisError::UnexpectedEof);
        }
        while self.line_buf.last() == Some(&b'\n') || self.line_buf.last() == Some(&b'\r') {
            self.line_buf.pop();
        }
        Ok(())
    }

    async fn read_exact_crlf(&mut self, len: usize) -> RedisResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        Ok(buf)
    }

    /// Reads a fresh line, then dispatches on it. `top_level` gates both
    /// the monitor-relabeling pass and whether a leading attribute applies
    /// at top level (it always does; the flag only follows through to the
    /// scalar it decorates).
    fn decode_inner<'a>(
        &'a mut self,
        top_level: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RedisResult<RedisValue>> + Send + 'a>> {
        Box::pin(async move {
            self.read_line().await?;
            if self.line_buf.is_empty() {
                return Err(RedisError::UnexpectedEof);
            }
            self.dispatch_current_line(top_level).await
        })
    }

    /// Dispatches on whatever is currently in `line_buf` without reading a
    /// new line first. Used both by `decode_inner` (after it reads a fresh
    /// line) and by streamed-aggregate loops, which must re-dispatch on a
    /// line they already consumed while checking for the `.` terminator.
    fn dispatch_current_line<'a>(
        &'a mut self,
        top_level: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RedisResult<RedisValue>> + Send + 'a>> {
        Box::pin(async move {
            let prefix = self.line_buf[0];
            if prefix == b'|' {
                let count_str = std::str::from_utf8(&self.line_buf[1..])
                    .map_err(|_| RedisError::UnexpectedEof)?
                    .to_string();
                let attrs = self.decode_pairs(&count_str).await?;
                let mut value = self.decode_inner(false).await?;
                value.attributes = if attrs.is_empty() {
                    None
                } else {
                    Some(Attributes(attrs))
                };
                return Ok(value);
            }

            let rest = std::str::from_utf8(&self.line_buf[1..])
                .map_err(|_| RedisError::UnexpectedEof)?
                .to_string();

            let kind = match prefix {
                b'+' => ValueKind::SimpleString(rest),
                b'-' => {
                    let err = RedisError::from_error_line(&rest);
                    let (code, message) = match err {
                        RedisError::Server { code, message } => (code, message),
                        _ => unreachable!(),
                    };
                    ValueKind::SimpleError { code, message }
                }
                b':' => ValueKind::Number(
                    rest.parse::<i64>()
                        .map_err(|_| RedisError::InvalidNumber(rest.clone()))?,
                ),
                b'_' => ValueKind::Null,
                b',' => ValueKind::Double(parse_double(&rest)?),
                b'#' => ValueKind::Boolean(parse_boolean(&rest)?),
                b'$' => return self.decode_blob_string(&rest, top_level).await,
                b'=' => return self.decode_verbatim_string(&rest).await,
                b'!' => return self.decode_blob_error(&rest).await,
                b'(' => {
                    validate_big_number(&rest)?;
                    ValueKind::BigNumber(rest)
                }
                b'*' => return self.decode_array(&rest).await,
                b'%' => return self.decode_map(&rest).await,
                b'~' => return self.decode_set(&rest).await,
                b'>' => return self.decode_push(&rest).await,
                other => {
                    return Err(RedisError::UnexpectedCharacter {
                        actual: other as char,
                        expected: '+',
                    })
                }
            };

            let value = RedisValue::new(kind);
            if top_level {
                Ok(maybe_relabel_monitor(value))
            } else {
                Ok(value)
            }
        })
    }

    async fn decode_blob_string(&mut self, len_str: &str, top_level: bool) -> RedisResult<RedisValue> {
        if len_str == "?" {
            let body = self.decode_streamed_string().await?;
            return Ok(RedisValue::new(ValueKind::SimpleString(body)));
        }
        let len: i64 = len_str
            .parse()
            .map_err(|_| RedisError::InvalidNumber(len_str.to_string()))?;
        if len < 0 {
            return Ok(RedisValue::new(ValueKind::Null));
        }
        let bytes = self.read_exact_crlf(len as usize).await?;
        let body = String::from_utf8_lossy(&bytes).into_owned();
        let value = RedisValue::new(ValueKind::SimpleString(body));
        if top_level {
            Ok(maybe_relabel_monitor(value))
        } else {
            Ok(value)
        }
    }

    async fn decode_streamed_string(&mut self) -> RedisResult<String> {
        let mut out = Vec::new();
        loop {
            self.read_line().await?;
            if self.line_buf.first() != Some(&b';') {
                return Err(RedisError::UnexpectedCharacter {
                    actual: *self.line_buf.first().unwrap_or(&b'?') as char,
                    expected: ';',
                });
            }
            let len_str = std::str::from_utf8(&self.line_buf[1..])
                .map_err(|_| RedisError::UnexpectedEof)?;
            let len: usize = len_str
                .parse()
                .map_err(|_| RedisError::InvalidNumber(len_str.to_string()))?;
            if len == 0 {
                break;
            }
            let chunk = self.read_exact_crlf(len).await?;
            out.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn decode_verbatim_string(&mut self, len_str: &str) -> RedisResult<RedisValue> {
        let len: usize = len_str
            .parse()
            .map_err(|_| RedisError::InvalidNumber(len_str.to_string()))?;
        let bytes = self.read_exact_crlf(len).await?;
        if bytes.len() < 4 || bytes[3] != b':' {
            return Err(RedisError::UnexpectedEof);
        }
        let format = String::from_utf8_lossy(&bytes[..3]).into_owned();
        let body = String::from_utf8_lossy(&bytes[4..]).into_owned();
        Ok(RedisValue::new(ValueKind::VerbatimString { format, body }))
    }

    async fn decode_blob_error(&mut self, len_str: &str) -> RedisResult<RedisValue> {
        let len: usize = len_str
            .parse()
            .map_err(|_| RedisError::InvalidNumber(len_str.to_string()))?;
        let bytes = self.read_exact_crlf(len).await?;
        let line = String::from_utf8_lossy(&bytes).into_owned();
        let (code, message) = match line.split_once(' ') {
            Some((c, m)) => (c.to_string(), m.to_string()),
            None => (line, String::new()),
        };
        Ok(RedisValue::new(ValueKind::BlobError { code, message }))
    }

    /// Decodes `count` elements, honoring streamed (`?`) aggregates
    /// terminated by a `.` sentinel line.
    async fn decode_elements(&mut self, count_str: &str) -> RedisResult<Vec<RedisValue>> {
        if count_str == "?" {
            let mut items = Vec::new();
            loop {
                self.read_line().await?;
                if self.line_buf.first() == Some(&b'.') {
                    break;
                }
                let item = self.dispatch_current_line(false).await?;
                items.push(item);
            }
            return Ok(items);
        }
        let count: usize = count_str
            .parse()
            .map_err(|_| RedisError::InvalidNumber(count_str.to_string()))?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.decode_inner(false).await?);
        }
        Ok(items)
    }

    async fn decode_array(&mut self, count_str: &str) -> RedisResult<RedisValue> {
        if count_str.starts_with('-') {
            return Ok(RedisValue::new(ValueKind::Null));
        }
        let items = self.decode_elements(count_str).await?;
        Ok(RedisValue::new(ValueKind::Array(items)))
    }

    async fn decode_set(&mut self, count_str: &str) -> RedisResult<RedisValue> {
        let items = self.decode_elements(count_str).await?;
        Ok(RedisValue::new(ValueKind::Set(items)))
    }

    async fn decode_pairs(&mut self, count_str: &str) -> RedisResult<Pairs> {
        if count_str == "?" {
            let mut pairs = Vec::new();
            loop {
                self.read_line().await?;
                if self.line_buf.first() == Some(&b'.') {
                    break;
                }
                let key = self.dispatch_current_line(false).await?;
                let value = self.decode_inner(false).await?;
                pairs.push((key, value));
            }
            return Ok(pairs);
        }
        let count: usize = count_str
            .parse()
            .map_err(|_| RedisError::InvalidNumber(count_str.to_string()))?;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.decode_inner(false).await?;
            let value = self.decode_inner(false).await?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    async fn decode_map(&mut self, count_str: &str) -> RedisResult<RedisValue> {
        let pairs = self.decode_pairs(count_str).await?;
        Ok(RedisValue::new(ValueKind::Map(pairs)))
    }

    async fn decode_push(&mut self, count_str: &str) -> RedisResult<RedisValue> {
        let count: usize = count_str
            .parse()
            .map_err(|_| RedisError::InvalidNumber(count_str.to_string()))?;
        if count == 0 {
            return Ok(RedisValue::new(ValueKind::Push {
                kind: PushKind::Other(String::new()),
                data: Vec::new(),
            }));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.decode_inner(false).await?);
        }
        let kind_str = items[0].to_string().unwrap_or_default();
        let kind = PushKind::from_wire(&kind_str);
        let data = items.into_iter().skip(1).collect();
        Ok(RedisValue::new(ValueKind::Push { kind, data }))
    }
}

impl<R: AsyncBufRead + Unpin + CapturedBytes + Send> Decoder<R> {
    /// Decodes exactly one top-level value, the same as [`Decoder::decode_value`],
    /// and additionally returns the raw wire bytes consumed for it. Used by
    /// the connection's reader task so the byte-level tracer sees the same
    /// kind of payload on both directions instead of a parsed value's
    /// `Debug` text.
    pub async fn decode_value_traced(&mut self) -> (RedisResult<RedisValue>, Vec<u8>) {
        let result = self.decode_inner(true).await;
        let raw = self.reader.take_captured();
        (result, raw)
    }
}

/// Monitor notifications arrive as ordinary simple/blob strings whose body
/// matches the monitor grammar; the decoder detects this shape and
/// re-labels the value as a push.
fn maybe_relabel_monitor(value: RedisValue) -> RedisValue {
    if let ValueKind::SimpleString(ref body) = value.kind {
        if let Some(entry) = monitor::try_parse(body) {
            return RedisValue::new(ValueKind::Push {
                kind: PushKind::Monitor,
                data: vec![entry.into_value()],
            });
        }
    }
    value
}

fn parse_double(s: &str) -> RedisResult<f64> {
    match s {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|_| RedisError::InvalidDouble(other.to_string())),
    }
}

fn parse_boolean(s: &str) -> RedisResult<bool> {
    match s {
        "t" => Ok(true),
        "f" => Ok(false),
        other => Err(RedisError::InvalidBoolean(other.to_string())),
    }
}

fn validate_big_number(s: &str) -> RedisResult<()> {
    let body = s.strip_prefix('-').unwrap_or(s);
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RedisError::InvalidBigNumber(s.to_string()));
    }
    Ok(())
}
