//! Monitor notification parsing. `MONITOR` replies arrive as
//! plain strings (simple or blob) shaped like:
//!
//! ```text
//! <secs>.<frac> [<db> <addr>] "<quoted arg>" ("<quoted arg>")*
//! ```
//!
//! The codec detects this shape on any top-level string reply and
//! re-labels it as a push, since later server versions may emit a native
//! push type instead — this parser accepts either by running on the
//! string body regardless of how it arrived.

use crate::value::{RedisValue, ValueKind};

/// A minimum length below which a string could not possibly be a monitor
/// line, used to avoid false-positive relabeling of ordinary replies.
const MIN_MONITOR_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEntry {
    pub time_secs: i64,
    pub time_nanos: u32,
    pub db: i64,
    pub addr: String,
    pub cmds: Vec<String>,
}

impl MonitorEntry {
    /// Renders the parsed entry back into a `RedisValue` tree, the shape
    /// the push router hands to the monitor callback.
    pub fn into_value(self) -> RedisValue {
        let fields = vec![
            (
                RedisValue::new(ValueKind::SimpleString("time_secs".into())),
                RedisValue::new(ValueKind::Number(self.time_secs)),
            ),
            (
                RedisValue::new(ValueKind::SimpleString("time_nanos".into())),
                RedisValue::new(ValueKind::Number(self.time_nanos as i64)),
            ),
            (
                RedisValue::new(ValueKind::SimpleString("db".into())),
                RedisValue::new(ValueKind::Number(self.db)),
            ),
            (
                RedisValue::new(ValueKind::SimpleString("addr".into())),
                RedisValue::new(ValueKind::SimpleString(self.addr)),
            ),
            (
                RedisValue::new(ValueKind::SimpleString("cmds".into())),
                RedisValue::new(ValueKind::Array(
                    self.cmds
                        .into_iter()
                        .map(|c| RedisValue::new(ValueKind::SimpleString(c)))
                        .collect(),
                )),
            ),
        ];
        RedisValue::new(ValueKind::Map(fields))
    }
}

/// Attempts to parse `body` as a monitor notification. Returns `None` if it
/// does not match the grammar, leaving the caller free to treat it as an
/// ordinary string reply.
pub fn try_parse(body: &str) -> Option<MonitorEntry> {
    if body.len() < MIN_MONITOR_LEN {
        return None;
    }
    let mut rest = body;

    let (timestamp, after_ts) = split_token(rest)?;
    let (secs_str, frac_str) = timestamp.split_once('.')?;
    let time_secs: i64 = secs_str.parse().ok()?;
    let time_nanos = scale_to_nanos(frac_str)?;
    rest = after_ts.trim_start();

    let rest_stripped = rest.strip_prefix('[')?;
    let (bracketed, after_bracket) = rest_stripped.split_once(']')?;
    let (db_str, addr) = bracketed.split_once(' ')?;
    let db: i64 = db_str.trim().parse().ok()?;
    let addr = addr.trim().to_string();
    rest = after_bracket.trim_start();

    let cmds = parse_quoted_args(rest)?;
    if cmds.is_empty() {
        return None;
    }

    Some(MonitorEntry {
        time_secs,
        time_nanos,
        db,
        addr,
        cmds,
    })
}

fn split_token(s: &str) -> Option<(&str, &str)> {
    let idx = s.find(char::is_whitespace)?;
    Some((&s[..idx], &s[idx..]))
}

/// Scales a fractional-seconds string to nanoseconds: left-pads if fewer
/// than 9 digits, truncates if more.
fn scale_to_nanos(frac: &str) -> Option<u32> {
    if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut digits = frac.to_string();
    if digits.len() < 9 {
        digits.push_str(&"0".repeat(9 - digits.len()));
    } else {
        digits.truncate(9);
    }
    digits.parse().ok()
}

/// Parses a run of double-quoted, backslash-escaped arguments separated by
/// single spaces, e.g. `"set" "\"x" "6"`.
fn parse_quoted_args(s: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut chars = s.trim_end().chars().peekable();
    loop {
        match chars.peek() {
            None => break,
            Some(' ') => {
                chars.next();
                continue;
            }
            Some('"') => {
                chars.next();
                let mut arg = String::new();
                loop {
                    match chars.next()? {
                        '\\' => arg.push(chars.next()?),
                        '"' => break,
                        c => arg.push(c),
                    }
                }
                args.push(arg);
            }
            Some(_) => return None,
        }
    }
    Some(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_scenario() {
        let body = r#"1339518090.420270 [15 127.0.0.1:60866] "set" "\"x" "6""#;
        let entry = try_parse(body).expect("should parse");
        assert_eq!(entry.time_secs, 1339518090);
        assert_eq!(entry.time_nanos, 420_270_000);
        assert_eq!(entry.db, 15);
        assert_eq!(entry.addr, "127.0.0.1:60866");
        assert_eq!(entry.cmds, vec!["set", "\"x", "6"]);
    }

    #[test]
    fn rejects_ordinary_short_strings() {
        assert!(try_parse("OK").is_none());
        assert!(try_parse("PONG").is_none());
    }

    #[test]
    fn rejects_strings_without_brackets() {
        assert!(try_parse("1339518090.420270 not a monitor line at all").is_none());
    }

    #[test]
    fn scales_short_and_long_fractions() {
        assert_eq!(scale_to_nanos("5").unwrap(), 500_000_000);
        assert_eq!(scale_to_nanos("123456789999").unwrap(), 123_456_789);
    }
}
