use bincode::de::{BorrowDecoder, Decoder};
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{config, BorrowDecode, Decode, Encode};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::time::{SystemTime, UNIX_EPOCH};

pub static BINCODE_CONF: config::Configuration = config::standard();

/// Largest representable timestamp; windows ending here never get a cleanup timer.
pub const MAX_TIMESTAMP: i64 = i64::MAX;

/// Watermark value before any watermark has been observed.
pub const MIN_WATERMARK: i64 = i64::MIN;

pub const STATE_CACHE_SIZE_ENV: &str = "EDDY_STATE_CACHE_SIZE";

pub fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

pub trait Key: Debug + Clone + Encode + Decode + Hash + PartialEq + Eq + Send + 'static {}
impl<T: Debug + Clone + Encode + Decode + Hash + PartialEq + Eq + Send + 'static> Key for T {}

pub trait Data: Debug + Clone + Encode + Decode + Send + PartialEq + 'static {}
impl<T: Debug + Clone + Encode + Decode + Send + PartialEq + 'static> Data for T {}

/// A single field of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(f.0),
            _ => None,
        }
    }

    /// Integer arithmetic wraps so that add and sub stay exact inverses.
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(Value::Int(a.wrapping_add(*b))),
            (Value::Float(a), Value::Float(b)) => Some(Value::Float(*a + *b)),
            (Value::Int(a), Value::Float(b)) => Some(Value::Float(OrderedFloat(*a as f64) + *b)),
            (Value::Float(a), Value::Int(b)) => Some(Value::Float(*a + OrderedFloat(*b as f64))),
            _ => None,
        }
    }

    pub fn checked_sub(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(Value::Int(a.wrapping_sub(*b))),
            (Value::Float(a), Value::Float(b)) => Some(Value::Float(*a - *b)),
            (Value::Int(a), Value::Float(b)) => Some(Value::Float(OrderedFloat(*a as f64) - *b)),
            (Value::Float(a), Value::Int(b)) => Some(Value::Float(*a - OrderedFloat(*b as f64))),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v.0),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(OrderedFloat(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// OrderedFloat has no bincode impls, so Value is encoded by hand.
impl Encode for Value {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.tag().encode(encoder)?;
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => b.encode(encoder),
            Value::Int(i) => i.encode(encoder),
            Value::Float(f) => f.0.encode(encoder),
            Value::String(s) => s.encode(encoder),
        }
    }
}

impl Decode for Value {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, DecodeError> {
        let tag = u8::decode(decoder)?;
        Ok(match tag {
            0 => Value::Null,
            1 => Value::Bool(bool::decode(decoder)?),
            2 => Value::Int(i64::decode(decoder)?),
            3 => Value::Float(OrderedFloat(f64::decode(decoder)?)),
            4 => Value::String(String::decode(decoder)?),
            other => {
                return Err(DecodeError::OtherString(format!(
                    "invalid value tag {}",
                    other
                )))
            }
        })
    }
}

impl<'de> BorrowDecode<'de> for Value {
    fn borrow_decode<D: BorrowDecoder<'de>>(decoder: &mut D) -> Result<Self, DecodeError> {
        Value::decode(decoder)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum RowKind {
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

impl RowKind {
    pub fn is_accumulate(&self) -> bool {
        matches!(self, RowKind::Insert | RowKind::UpdateAfter)
    }

    pub fn is_retract(&self) -> bool {
        !self.is_accumulate()
    }

    pub fn short_string(&self) -> &'static str {
        match self {
            RowKind::Insert => "+I",
            RowKind::UpdateBefore => "-U",
            RowKind::UpdateAfter => "+U",
            RowKind::Delete => "-D",
        }
    }
}

/// A record flowing in or out of an operation; the kind marks it as a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Row {
    pub kind: RowKind,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(kind: RowKind, values: Vec<Value>) -> Self {
        Row { kind, values }
    }

    pub fn insert(values: Vec<Value>) -> Self {
        Row::new(RowKind::Insert, values)
    }

    pub fn delete(values: Vec<Value>) -> Self {
        Row::new(RowKind::Delete, values)
    }

    /// Concatenates the grouping key with the computed values.
    pub fn join(kind: RowKind, key: &[Value], values: Vec<Value>) -> Self {
        let mut joined = Vec::with_capacity(key.len() + values.len());
        joined.extend_from_slice(key);
        joined.extend(values);
        Row::new(kind, joined)
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::encode_to_vec(self, BINCODE_CONF)
    }

    pub fn from_bytes(bs: &[u8]) -> Result<Row, DecodeError> {
        let (row, len) = bincode::decode_from_slice(bs, BINCODE_CONF)?;

        if len != bs.len() {
            return Err(DecodeError::ArrayLengthMismatch {
                required: bs.len(),
                found: len,
            });
        }

        Ok(row)
    }
}

impl Display for Row {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.kind.short_string())?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct TaskInfo {
    pub job_id: String,
    pub operator_name: String,
    pub operator_id: String,
    pub task_index: usize,
    pub parallelism: usize,
}

impl TaskInfo {
    pub fn for_test(job_id: &str, operator_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operator_name: "op".to_string(),
            operator_id: operator_id.to_string(),
            task_index: 0,
            parallelism: 1,
        }
    }

    pub fn metric_label_map(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("operator_id".to_string(), self.operator_id.clone());
        labels.insert("subtask_idx".to_string(), format!("{}", self.task_index));
        labels.insert("operator_name".to_string(), self.operator_name.clone());
        labels
    }
}
