//! The RESP3 value model: a tagged sum of every wire-level
//! reply shape plus the conversion protocol used to project it into scalar
//! and aggregate Rust types.

use crate::error::{RedisError, RedisResult};

/// An ordered key/value sequence. RESP3 map keys need not be strings, so
/// this is a `Vec` of pairs rather than a `HashMap`; insertion order is the
/// wire order and is preserved.
pub type Pairs = Vec<(RedisValue, RedisValue)>;

/// Attributes are a RESP3 map attached to the value immediately following
/// them on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(pub Pairs);

impl Attributes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up an attribute by a string key, the common case (e.g. `ttl`).
    pub fn get_str(&self, key: &str) -> Option<&RedisValue> {
        self.0.iter().find_map(|(k, v)| match &k.kind {
            ValueKind::SimpleString(s) | ValueKind::VerbatimString { body: s, .. }
                if s == key =>
            {
                Some(v)
            }
            _ => None,
        })
    }
}

/// A sorted-set score bound: either a closed endpoint (`<n>`) or an open one
/// (`(<n>`), with `+inf`/`-inf` sentinels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    Closed(f64),
    Open(f64),
}

impl ScoreBound {
    /// Renders the bound the way the encoder writes it as a command
    /// argument: `"<num>"`, `"(<num>"`, or the infinity sentinels.
    pub fn to_arg_string(self) -> String {
        match self {
            ScoreBound::Closed(f) => format_double(f),
            ScoreBound::Open(f) => format!("({}", format_double(f)),
        }
    }
}

fn format_double(f: f64) -> String {
    if f.is_infinite() {
        if f > 0.0 { "+inf".to_string() } else { "-inf".to_string() }
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(f).to_string()
    }
}

/// The out-of-band push kind, carried alongside its payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PushKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    SSubscribe,
    SUnsubscribe,
    Message,
    PMessage,
    SMessage,
    Invalidate,
    Monitor,
    Other(String),
}

impl PushKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "subscribe" => PushKind::Subscribe,
            "unsubscribe" => PushKind::Unsubscribe,
            "psubscribe" => PushKind::PSubscribe,
            "punsubscribe" => PushKind::PUnsubscribe,
            "ssubscribe" => PushKind::SSubscribe,
            "sunsubscribe" => PushKind::SUnsubscribe,
            "message" => PushKind::Message,
            "pmessage" => PushKind::PMessage,
            "smessage" => PushKind::SMessage,
            "invalidate" => PushKind::Invalidate,
            other => PushKind::Other(other.to_string()),
        }
    }

    /// Subscribe/unsubscribe acknowledgements are consumed inline by the
    /// dispatcher to satisfy a request; they never surface to a
    /// generic push subscriber as a standalone notification.
    pub fn is_subscription_ack(&self) -> bool {
        matches!(
            self,
            PushKind::Subscribe
                | PushKind::Unsubscribe
                | PushKind::PSubscribe
                | PushKind::PUnsubscribe
                | PushKind::SSubscribe
                | PushKind::SUnsubscribe
        )
    }
}

/// A RESP3 value together with any attributes the server attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisValue {
    pub kind: ValueKind,
    pub attributes: Option<Attributes>,
}

impl RedisValue {
    pub fn new(kind: ValueKind) -> Self {
        RedisValue {
            kind,
            attributes: None,
        }
    }

    pub fn with_attributes(kind: ValueKind, attributes: Attributes) -> Self {
        RedisValue {
            kind,
            attributes: if attributes.is_empty() {
                None
            } else {
                Some(attributes)
            },
        }
    }

    pub fn nil() -> Self {
        RedisValue::new(ValueKind::Null)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    /// Exposes the attribute map the server attached to this value, if any.
    pub fn attr(&self) -> Option<&Attributes> {
        self.attributes.as_ref()
    }

    /// If this value is (or carries) a server error, surfaces it as an
    /// `Err`; otherwise returns the value unchanged. Used by the
    /// dispatcher so a `-ERR ...`/`!...` reply fails the handle instead of
    /// being handed back as a value.
    pub fn into_result(self) -> RedisResult<RedisValue> {
        match &self.kind {
            ValueKind::SimpleError { code, message } | ValueKind::BlobError { code, message } => {
                Err(RedisError::Server {
                    code: code.clone(),
                    message: message.clone(),
                })
            }
            _ => Ok(self),
        }
    }

    pub fn to_string(&self) -> RedisResult<String> {
        match &self.kind {
            ValueKind::SimpleString(s) => Ok(s.clone()),
            ValueKind::VerbatimString { body, .. } => Ok(body.clone()),
            ValueKind::Number(n) => Ok(n.to_string()),
            ValueKind::Double(d) => Ok(format_double(*d)),
            ValueKind::BigNumber(s) => Ok(s.clone()),
            ValueKind::Boolean(b) => Ok(if *b { "true" } else { "false" }.to_string()),
            other => Err(self.conversion_error("String", other)),
        }
    }

    pub fn to_i64(&self) -> RedisResult<i64> {
        match &self.kind {
            ValueKind::SimpleString(s) | ValueKind::VerbatimString { body: s, .. } => s
                .parse::<i64>()
                .map_err(|_| self.conversion_error("i64", &self.kind)),
            ValueKind::Number(n) => Ok(*n),
            ValueKind::BigNumber(s) => s
                .parse::<i64>()
                .map_err(|_| self.conversion_error("i64", &self.kind)),
            ValueKind::Boolean(b) => Ok(if *b { 1 } else { 0 }),
            other => Err(self.conversion_error("i64", other)),
        }
    }

    pub fn to_f64(&self) -> RedisResult<f64> {
        match &self.kind {
            ValueKind::SimpleString(s) | ValueKind::VerbatimString { body: s, .. } => s
                .parse::<f64>()
                .map_err(|_| self.conversion_error("f64", &self.kind)),
            ValueKind::Number(n) => Ok(*n as f64),
            ValueKind::Double(d) => Ok(*d),
            ValueKind::BigNumber(s) => s
                .parse::<f64>()
                .map_err(|_| self.conversion_error("f64", &self.kind)),
            ValueKind::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            other => Err(self.conversion_error("f64", other)),
        }
    }

    pub fn to_bool(&self) -> RedisResult<bool> {
        match &self.kind {
            ValueKind::SimpleString(s) => Ok(s == "OK"),
            ValueKind::VerbatimString { body, .. } => Ok(body == "OK"),
            ValueKind::Number(n) => Ok(*n != 0),
            ValueKind::Double(d) => Ok(*d != 0.0),
            ValueKind::BigNumber(s) => Ok(!s.trim_start_matches('-').chars().all(|c| c == '0')),
            ValueKind::Boolean(b) => Ok(*b),
            other => Err(self.conversion_error("bool", other)),
        }
    }

    /// Exposes the verbatim-string format tag (e.g. `txt`, `mkd`) for
    /// consumers who need it; any other kind fails the conversion.
    pub fn to_verbatim_format(&self) -> RedisResult<&str> {
        match &self.kind {
            ValueKind::VerbatimString { format, .. } => Ok(format.as_str()),
            other => Err(self.conversion_error("verbatim-format", other)),
        }
    }

    pub fn to_slice(&self) -> RedisResult<&[RedisValue]> {
        match &self.kind {
            ValueKind::Array(v) | ValueKind::Set(v) => Ok(v.as_slice()),
            ValueKind::Null => Ok(&[]),
            other => Err(self.conversion_error("slice", other)),
        }
    }

    pub fn to_map(&self) -> RedisResult<&Pairs> {
        match &self.kind {
            ValueKind::Map(pairs) => Ok(pairs),
            other => Err(self.conversion_error("map", other)),
        }
    }

    pub fn to_set(&self) -> RedisResult<&[RedisValue]> {
        match &self.kind {
            ValueKind::Set(v) => Ok(v.as_slice()),
            ValueKind::Null => Ok(&[]),
            other => Err(self.conversion_error("set", other)),
        }
    }

    /// Projects a map/array-of-pairs reply into `HashMap<String, String>`.
    pub fn to_string_string_map(&self) -> RedisResult<Vec<(String, String)>> {
        match &self.kind {
            ValueKind::Null => Ok(Vec::new()),
            ValueKind::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| Ok((k.to_string()?, v.to_string()?)))
                .collect(),
            ValueKind::Array(items) | ValueKind::Set(items) => {
                if items.len() % 2 != 0 {
                    return Err(self.conversion_error("string-string-map", &self.kind));
                }
                items
                    .chunks(2)
                    .map(|pair| Ok((pair[0].to_string()?, pair[1].to_string()?)))
                    .collect()
            }
            other => Err(self.conversion_error("string-string-map", other)),
        }
    }

    pub fn to_string_slice(&self) -> RedisResult<Vec<String>> {
        match &self.kind {
            ValueKind::Null => Ok(Vec::new()),
            ValueKind::Array(items) | ValueKind::Set(items) => {
                items.iter().map(|v| v.to_string()).collect()
            }
            other => Err(self.conversion_error("string-slice", other)),
        }
    }

    pub fn to_int64_slice(&self) -> RedisResult<Vec<i64>> {
        match &self.kind {
            ValueKind::Null => Ok(Vec::new()),
            ValueKind::Array(items) | ValueKind::Set(items) => {
                items.iter().map(|v| v.to_i64()).collect()
            }
            other => Err(self.conversion_error("int64-slice", other)),
        }
    }

    /// `XRANGE`-shaped projection: an array of `[id, [field, value, ...]]`
    /// pairs becomes `Vec<(String, Vec<(String, String)>)>`.
    pub fn to_xrange(&self) -> RedisResult<Vec<(String, Vec<(String, String)>)>> {
        let entries = self.to_slice()?;
        entries
            .iter()
            .map(|entry| {
                let pair = entry.to_slice()?;
                if pair.len() != 2 {
                    return Err(entry.conversion_error("xrange-entry", &entry.kind));
                }
                let id = pair[0].to_string()?;
                let fields = pair[1]
                    .to_slice()?
                    .chunks(2)
                    .map(|kv| Ok((kv[0].to_string()?, kv[1].to_string()?)))
                    .collect::<RedisResult<Vec<_>>>()?;
                Ok((id, fields))
            })
            .collect()
    }

    /// `XREAD`-shaped projection: a map/array of `[stream, entries]` pairs.
    pub fn to_xread(
        &self,
    ) -> RedisResult<Vec<(String, Vec<(String, Vec<(String, String)>)>)>> {
        match &self.kind {
            ValueKind::Null => Ok(Vec::new()),
            ValueKind::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| Ok((k.to_string()?, v.to_xrange()?)))
                .collect(),
            ValueKind::Array(items) => items
                .iter()
                .map(|entry| {
                    let pair = entry.to_slice()?;
                    if pair.len() != 2 {
                        return Err(entry.conversion_error("xread-entry", &entry.kind));
                    }
                    Ok((pair[0].to_string()?, pair[1].to_xrange()?))
                })
                .collect(),
            other => Err(self.conversion_error("xread", other)),
        }
    }

    /// Renders nested arrays/maps into a generic `Tree` shape, used by
    /// callers that want to walk a reply without knowing its command's
    /// exact shape ahead of time.
    pub fn to_tree(&self) -> Tree {
        match &self.kind {
            ValueKind::Null => Tree::Null,
            ValueKind::Boolean(b) => Tree::Bool(*b),
            ValueKind::Number(n) => Tree::Int(*n),
            ValueKind::Double(d) => Tree::Float(*d),
            ValueKind::BigNumber(s) => Tree::Leaf(s.clone()),
            ValueKind::SimpleString(s) => Tree::Leaf(s.clone()),
            ValueKind::VerbatimString { body, .. } => Tree::Leaf(body.clone()),
            ValueKind::SimpleError { code, message } | ValueKind::BlobError { code, message } => {
                Tree::Error(format!("{code} {message}"))
            }
            ValueKind::Array(items) | ValueKind::Set(items) => {
                Tree::List(items.iter().map(RedisValue::to_tree).collect())
            }
            ValueKind::Map(pairs) => Tree::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_tree(), v.to_tree()))
                    .collect(),
            ),
            ValueKind::Push { kind, data } => Tree::Push(
                format!("{kind:?}"),
                data.iter().map(RedisValue::to_tree).collect(),
            ),
        }
    }

    fn conversion_error(&self, to: &'static str, value: &ValueKind) -> RedisError {
        RedisError::Conversion {
            to,
            value: format!("{value:?}"),
        }
    }
}

/// A caller-facing, command-shape-agnostic rendering of a `RedisValue`.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Leaf(String),
    Error(String),
    List(Vec<Tree>),
    Map(Vec<(Tree, Tree)>),
    Push(String, Vec<Tree>),
}

/// The wire-level variant tag. Kept separate from `RedisValue` so
/// the attribute sidecar is not duplicated into every match arm.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Null,
    SimpleString(String),
    VerbatimString { format: String, body: String },
    Number(i64),
    Double(f64),
    BigNumber(String),
    Boolean(bool),
    SimpleError { code: String, message: String },
    BlobError { code: String, message: String },
    Array(Vec<RedisValue>),
    Map(Pairs),
    Set(Vec<RedisValue>),
    Push { kind: PushKind, data: Vec<RedisValue> },
}
