//! Stateful grouped aggregation over changelog streams: non-windowed group aggregates,
//! table aggregates, and tumbling group-window aggregates, each driven in batches by an
//! external runner that owns the timer queue and the state backend.

pub mod aggregates;
pub mod aggs_handle;
pub mod config;
mod error;
pub mod group_agg;
pub mod key_selector;
pub mod logging;
pub mod operation;
pub mod table_agg;
pub mod timer;
pub mod windows;

pub use error::{Error, Result};
pub use key_selector::GroupKey;
pub use operation::{
    ElementType, Input, Operation, OperationBuilder, Output, TimerPayload, TimerRequest,
};
