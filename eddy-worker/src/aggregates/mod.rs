//! User-facing aggregate functions and the accumulators they operate on.

use crate::{Error, Result};
use bincode::{Decode, Encode};
use eddy_metrics::MetricsContext;
use eddy_types::{TaskInfo, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

mod builtin;
mod table;

pub use builtin::{Avg, Count, CountStar, Max, Min, Sum, Sum0};
pub use table::{TableAggregateFunction, TableAggregateKind, TopN};

/// Resources handed to functions when their operation opens.
#[derive(Clone, Copy)]
pub struct FunctionContext<'a> {
    pub task_info: &'a TaskInfo,
    pub metrics: &'a MetricsContext,
}

pub trait Lifecycle {
    fn open(&mut self, _ctx: &FunctionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Accumulator state, stored per key (and per window) between invocations.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Accumulator {
    Count(i64),
    /// Running sum plus the number of non-null contributions.
    Sum { sum: Value, count: i64 },
    /// Multiset of observed values, so retraction can restore a previous extremum.
    Values(BTreeMap<Value, u64>),
    /// Free-form storage for user defined functions.
    Custom(Vec<Value>),
}

impl Accumulator {
    pub(crate) fn shape_error(&self, expected: &str) -> Error {
        Error::Codec(format!("expected {} accumulator, found {:?}", expected, self))
    }

    pub(crate) fn add_value(values: &mut BTreeMap<Value, u64>, value: Value) {
        *values.entry(value).or_default() += 1;
    }

    pub(crate) fn remove_value(values: &mut BTreeMap<Value, u64>, value: &Value) {
        if let Some(count) = values.get_mut(value) {
            *count -= 1;
            if *count == 0 {
                values.remove(value);
            }
        }
    }
}

/// An aggregate over a group of rows that supports retraction.
///
/// `accumulate` followed by `retract` with the same arguments must leave the accumulator
/// observably unchanged.
pub trait AggregateFunction: Lifecycle + Debug + Send {
    fn create_accumulator(&self) -> Accumulator;

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()>;

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()>;

    fn merge(&self, acc: &mut Accumulator, _other: &Accumulator) -> Result<()> {
        Err(Error::unsupported(format!(
            "merge is not supported by {:?}",
            acc
        )))
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Count,
    CountStar,
    Sum,
    Sum0,
    Min,
    Max,
    Avg,
    /// A function registered under this name in the [`FunctionRegistry`].
    Udf(String),
}

pub type AggregateFactory = Arc<dyn Fn() -> Box<dyn AggregateFunction> + Send + Sync>;
pub type TableAggregateFactory = Arc<dyn Fn() -> Box<dyn TableAggregateFunction> + Send + Sync>;

/// Resolves aggregate kinds to function instances. Built-ins are always available; user
/// defined functions are looked up by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    aggregates: HashMap<String, AggregateFactory>,
    table_aggregates: HashMap<String, TableAggregateFactory>,
}

impl Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("aggregates", &self.aggregates.keys().collect::<Vec<_>>())
            .field(
                "table_aggregates",
                &self.table_aggregates.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FunctionRegistry {
    pub fn register_aggregate<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn AggregateFunction> + Send + Sync + 'static,
    {
        self.aggregates.insert(name.into(), Arc::new(factory));
    }

    pub fn register_table_aggregate<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn TableAggregateFunction> + Send + Sync + 'static,
    {
        self.table_aggregates.insert(name.into(), Arc::new(factory));
    }

    pub fn create(&self, kind: &AggregateKind) -> Result<Box<dyn AggregateFunction>> {
        Ok(match kind {
            AggregateKind::Count => Box::new(Count),
            AggregateKind::CountStar => Box::new(CountStar),
            AggregateKind::Sum => Box::new(Sum),
            AggregateKind::Sum0 => Box::new(Sum0),
            AggregateKind::Min => Box::new(Min),
            AggregateKind::Max => Box::new(Max),
            AggregateKind::Avg => Box::new(Avg),
            AggregateKind::Udf(name) => {
                let factory = self.aggregates.get(name).ok_or_else(|| {
                    Error::config(format!("no aggregate function registered as '{}'", name))
                })?;
                factory()
            }
        })
    }

    pub fn create_table(&self, kind: &TableAggregateKind) -> Result<Box<dyn TableAggregateFunction>> {
        Ok(match kind {
            TableAggregateKind::TopN { n } => {
                if *n == 0 {
                    return Err(Error::config("top_n requires n > 0"));
                }
                Box::new(TopN::new(*n))
            }
            TableAggregateKind::Udf(name) => {
                let factory = self.table_aggregates.get(name).ok_or_else(|| {
                    Error::config(format!(
                        "no table aggregate function registered as '{}'",
                        name
                    ))
                })?;
                factory()
            }
        })
    }
}
