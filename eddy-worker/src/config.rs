//! Operation descriptions, as handed over by the planner in JSON.

use crate::aggregates::{AggregateKind, TableAggregateKind};
use crate::windows::NamedProperty;
use crate::{Error, Result};
use eddy_state::DEFAULT_STATE_CACHE_SIZE;
use eddy_types::STATE_CACHE_SIZE_ENV;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCall {
    pub kind: AggregateKind,
    #[serde(default)]
    pub inputs: Vec<usize>,
    /// Boolean field that must be true for a row to contribute.
    #[serde(default)]
    pub filter_arg: Option<usize>,
    #[serde(default)]
    pub distinct: bool,
}

impl AggregateCall {
    pub fn new(kind: AggregateKind, inputs: Vec<usize>) -> Self {
        AggregateCall {
            kind,
            inputs,
            filter_arg: None,
            distinct: false,
        }
    }

    pub fn with_filter(mut self, filter_arg: usize) -> Self {
        self.filter_arg = Some(filter_arg);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableAggregateCall {
    pub kind: TableAggregateKind,
    #[serde(default)]
    pub inputs: Vec<usize>,
}

fn default_true() -> bool {
    true
}

fn default_state_cache_size() -> usize {
    DEFAULT_STATE_CACHE_SIZE
}

fn default_operator_id() -> String {
    "group-aggregate".to_string()
}

/// Settings shared by every grouped aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAggConfig {
    #[serde(default = "default_operator_id")]
    pub operator_id: String,
    pub grouping: Vec<usize>,
    #[serde(default)]
    pub aggregates: Vec<AggregateCall>,
    #[serde(default)]
    pub index_of_count_star: Option<usize>,
    #[serde(default)]
    pub count_star_inserted: bool,
    #[serde(default)]
    pub generate_update_before: bool,
    #[serde(default = "default_true")]
    pub state_cleaning_enabled: bool,
    /// Drop an update whose new value equals the previous one.
    #[serde(default)]
    pub suppress_unchanged_updates: bool,
    /// Processing time after which an untouched key's state is cleared.
    #[serde(default)]
    pub idle_state_retention_ms: Option<i64>,
    #[serde(default = "default_state_cache_size")]
    pub state_cache_size: usize,
    #[serde(default)]
    pub metrics_enabled: bool,
    /// When known, every field reference is checked against it at setup.
    #[serde(default)]
    pub input_arity: Option<usize>,
}

impl GroupAggConfig {
    pub fn new(grouping: Vec<usize>, aggregates: Vec<AggregateCall>) -> Self {
        GroupAggConfig {
            operator_id: default_operator_id(),
            grouping,
            aggregates,
            index_of_count_star: None,
            count_star_inserted: false,
            generate_update_before: false,
            state_cleaning_enabled: true,
            suppress_unchanged_updates: false,
            idle_state_retention_ms: None,
            state_cache_size: DEFAULT_STATE_CACHE_SIZE,
            metrics_enabled: false,
            input_arity: None,
        }
    }

    fn check_field(&self, what: &str, idx: usize) -> Result<()> {
        match self.input_arity {
            Some(arity) if idx >= arity => Err(Error::config(format!(
                "{} refers to field {}, but input rows have {} fields",
                what, idx, arity
            ))),
            _ => Ok(()),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for idx in &self.grouping {
            if !seen.insert(*idx) {
                return Err(Error::config(format!(
                    "field {} appears twice in the grouping",
                    idx
                )));
            }
            self.check_field("grouping", *idx)?;
        }

        for (i, call) in self.aggregates.iter().enumerate() {
            for idx in &call.inputs {
                self.check_field(&format!("aggregate {}", i), *idx)?;
            }
            if let Some(idx) = call.filter_arg {
                self.check_field(&format!("filter of aggregate {}", i), idx)?;
            }
        }

        if let Some(retention) = self.idle_state_retention_ms {
            if retention <= 0 {
                return Err(Error::config("idle_state_retention_ms must be positive"));
            }
        }

        Ok(())
    }

    /// The configured cache size, unless overridden by the environment.
    pub fn resolved_state_cache_size(&self) -> Result<usize> {
        match std::env::var(STATE_CACHE_SIZE_ENV) {
            Ok(v) => {
                let size = parse_state_cache_size(&v)?;
                info!("using state cache size {} from {}", size, STATE_CACHE_SIZE_ENV);
                Ok(size)
            }
            Err(_) => Ok(self.state_cache_size),
        }
    }
}

fn parse_state_cache_size(raw: &str) -> Result<usize> {
    raw.trim().parse::<usize>().map_err(|_| {
        Error::config(format!(
            "{} is not a valid size: {:?}",
            STATE_CACHE_SIZE_ENV, raw
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTableAggConfig {
    #[serde(flatten)]
    pub base: GroupAggConfig,
    pub table_aggregate: TableAggregateCall,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Tumbling,
    Sliding,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupWindow {
    pub window_type: WindowType,
    /// Time windows are measured in milliseconds, count windows in rows.
    #[serde(default = "default_true")]
    pub is_time_window: bool,
    #[serde(default)]
    pub is_row_time: bool,
    pub size: i64,
    #[serde(default)]
    pub slide: Option<i64>,
    #[serde(default)]
    pub gap: Option<i64>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub allowed_lateness: i64,
    #[serde(default)]
    pub time_field_index: Option<usize>,
    #[serde(default)]
    pub named_properties: Vec<NamedProperty>,
}

impl GroupWindow {
    pub fn tumbling_time(size: i64, is_row_time: bool) -> Self {
        GroupWindow {
            window_type: WindowType::Tumbling,
            is_time_window: true,
            is_row_time,
            size,
            slide: None,
            gap: None,
            offset: 0,
            allowed_lateness: 0,
            time_field_index: None,
            named_properties: vec![],
        }
    }

    pub fn tumbling_count(size: i64) -> Self {
        GroupWindow {
            is_time_window: false,
            ..Self::tumbling_time(size, false)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupWindowAggConfig {
    #[serde(flatten)]
    pub base: GroupAggConfig,
    pub window: GroupWindow,
}

impl GroupWindowAggConfig {
    fn validate(&self) -> Result<()> {
        self.base.validate()?;
        let w = &self.window;

        match w.window_type {
            WindowType::Tumbling => {}
            other => {
                return Err(Error::unsupported(format!(
                    "{:?} group windows are not supported",
                    other
                )))
            }
        }

        if w.size <= 0 {
            return Err(Error::config("window size must be positive"));
        }
        if w.allowed_lateness < 0 {
            return Err(Error::config("allowed_lateness must not be negative"));
        }

        if w.is_time_window {
            if w.is_row_time {
                let idx = w.time_field_index.ok_or_else(|| {
                    Error::config("row-time windows require time_field_index")
                })?;
                self.base.check_field("time_field_index", idx)?;
            }
        } else if let Some(p) = w.named_properties.first() {
            return Err(Error::config(format!(
                "{:?} is not defined for count windows",
                p
            )));
        }

        Ok(())
    }
}

/// What to build. Deserialized from `{"kind": "group_aggregate", ...}` and friends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationDescription {
    GroupAggregate(GroupAggConfig),
    GroupTableAggregate(GroupTableAggConfig),
    GroupWindowAggregate(GroupWindowAggConfig),
}

impl OperationDescription {
    pub fn from_json(json: &str) -> Result<Self> {
        let description: OperationDescription = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid operation description: {}", e)))?;
        description.validate()?;
        Ok(description)
    }

    pub fn base(&self) -> &GroupAggConfig {
        match self {
            OperationDescription::GroupAggregate(c) => c,
            OperationDescription::GroupTableAggregate(c) => &c.base,
            OperationDescription::GroupWindowAggregate(c) => &c.base,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            OperationDescription::GroupAggregate(c) => c.validate(),
            OperationDescription::GroupTableAggregate(c) => {
                c.base.validate()?;
                if !c.base.aggregates.is_empty() {
                    return Err(Error::config(
                        "table aggregations take a single table_aggregate call",
                    ));
                }
                for idx in &c.table_aggregate.inputs {
                    c.base.check_field("table aggregate", *idx)?;
                }
                Ok(())
            }
            OperationDescription::GroupWindowAggregate(c) => c.validate(),
        }
    }
}
