//! Group windows: window identities, assigners that map rows to windows, and triggers that
//! decide when a window's result is emitted.

use crate::key_selector::GroupKey;
use crate::{Error, Result};
use bincode::{Decode, Encode};
use eddy_state::{BackingStore, StateStore, VOID_NAMESPACE};
use eddy_types::{Key, Row, Value, MAX_TIMESTAMP};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

mod trigger;
mod window_agg;

pub use trigger::{
    CountTrigger, EventTimeTrigger, ProcessingTimeTrigger, Trigger, TriggerContext, TriggerResult,
};
pub use window_agg::{GroupWindowAggFunction, WindowOptions};

const COUNT_ASSIGNER_TABLE: char = 'n';

pub trait Window: Key + Ord + Copy {
    /// Last timestamp that still belongs to the window.
    fn max_timestamp(&self) -> i64;

    /// `(start, end)` for windows measured in time.
    fn time_bounds(&self) -> Option<(i64, i64)>;
}

/// A half-open interval `[start, end)` in milliseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        TimeWindow { start, end }
    }
}

impl Window for TimeWindow {
    fn max_timestamp(&self) -> i64 {
        self.end - 1
    }

    fn time_bounds(&self) -> Option<(i64, i64)> {
        Some((self.start, self.end))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct CountWindow {
    pub id: i64,
}

impl Window for CountWindow {
    fn max_timestamp(&self) -> i64 {
        MAX_TIMESTAMP
    }

    fn time_bounds(&self) -> Option<(i64, i64)> {
        None
    }
}

/// Window attributes that may be appended to each window result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedProperty {
    WindowStart,
    WindowEnd,
    RowTime,
    ProcTime,
}

impl NamedProperty {
    pub fn value<W: Window>(&self, window: &W) -> Result<Value> {
        let (start, end) = window.time_bounds().ok_or_else(|| {
            Error::config(format!("{:?} is only defined for time windows", self))
        })?;
        Ok(Value::Int(match self {
            NamedProperty::WindowStart => start,
            NamedProperty::WindowEnd => end,
            NamedProperty::RowTime => end - 1,
            NamedProperty::ProcTime => -1,
        }))
    }
}

/// Maps an element to the windows it belongs to. Called once per element, so assigners
/// that keep per-key state may advance it.
pub trait WindowAssigner<W: Window>: Debug + Send {
    fn assign_windows<S: BackingStore>(
        &self,
        state: &mut StateStore<GroupKey, S>,
        element: &Row,
        timestamp: i64,
    ) -> Result<Vec<W>>;

    fn is_event_time(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct TumblingWindowAssigner {
    size: i64,
    offset: i64,
    is_event_time: bool,
}

impl TumblingWindowAssigner {
    pub fn new(size: i64, offset: i64, is_event_time: bool) -> Result<Self> {
        if size <= 0 {
            return Err(Error::config("tumbling window size must be positive"));
        }
        Ok(TumblingWindowAssigner {
            size,
            offset,
            is_event_time,
        })
    }

    pub fn window_start(&self, timestamp: i64) -> i64 {
        let timestamp = timestamp as i128;
        let start = timestamp - (timestamp - self.offset as i128).rem_euclid(self.size as i128);
        // windows that would start before i64::MIN are pinned to it
        start.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl WindowAssigner<TimeWindow> for TumblingWindowAssigner {
    fn assign_windows<S: BackingStore>(
        &self,
        _state: &mut StateStore<GroupKey, S>,
        _element: &Row,
        timestamp: i64,
    ) -> Result<Vec<TimeWindow>> {
        let start = self.window_start(timestamp);
        Ok(vec![TimeWindow::new(start, start.saturating_add(self.size))])
    }

    fn is_event_time(&self) -> bool {
        self.is_event_time
    }
}

/// Puts every `size` consecutive elements of a key into the same window.
#[derive(Debug, Clone, Copy)]
pub struct CountTumblingWindowAssigner {
    size: i64,
}

impl CountTumblingWindowAssigner {
    pub fn new(size: i64) -> Result<Self> {
        if size <= 0 {
            return Err(Error::config("count window size must be positive"));
        }
        Ok(CountTumblingWindowAssigner { size })
    }
}

impl WindowAssigner<CountWindow> for CountTumblingWindowAssigner {
    fn assign_windows<S: BackingStore>(
        &self,
        state: &mut StateStore<GroupKey, S>,
        _element: &Row,
        _timestamp: i64,
    ) -> Result<Vec<CountWindow>> {
        let count: i64 = state
            .get_value(COUNT_ASSIGNER_TABLE, VOID_NAMESPACE)?
            .unwrap_or(0);
        state.put_value(COUNT_ASSIGNER_TABLE, VOID_NAMESPACE, &(count + 1))?;
        Ok(vec![CountWindow {
            id: count / self.size,
        }])
    }

    fn is_event_time(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_state::InMemoryBackend;
    use test_case::test_case;

    fn store() -> StateStore<GroupKey, InMemoryBackend> {
        let mut store = StateStore::new(InMemoryBackend::default(), 10);
        store.set_current_key(vec![Value::from("k")]).unwrap();
        store
    }

    #[test_case(0, 0, 0; "zero")]
    #[test_case(9, 0, 0; "last in window")]
    #[test_case(10, 0, 10; "boundary opens next window")]
    #[test_case(-1, 0, -10; "negative")]
    #[test_case(12, 5, 5; "offset")]
    #[test_case(4, 5, -5; "offset before start")]
    #[test_case(i64::MIN, 3, i64::MIN; "earliest timestamp")]
    fn test_tumbling_start(ts: i64, offset: i64, start: i64) {
        let assigner = TumblingWindowAssigner::new(10, offset, true).unwrap();
        let windows = assigner
            .assign_windows(&mut store(), &Row::insert(vec![]), ts)
            .unwrap();
        assert_eq!(windows, vec![TimeWindow::new(start, start + 10)]);
        assert!(windows[0].start <= ts && ts < windows[0].end);
    }

    #[test]
    fn test_count_windows_advance_per_element() {
        let assigner = CountTumblingWindowAssigner::new(2).unwrap();
        let mut store = store();
        let ids: Vec<i64> = (0..5)
            .map(|_| {
                assigner
                    .assign_windows(&mut store, &Row::insert(vec![]), 0)
                    .unwrap()[0]
                    .id
            })
            .collect();
        assert_eq!(ids, vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn test_named_properties() {
        let w = TimeWindow::new(10, 20);
        assert_eq!(w.max_timestamp(), 19);
        assert_eq!(NamedProperty::WindowStart.value(&w).unwrap(), Value::Int(10));
        assert_eq!(NamedProperty::WindowEnd.value(&w).unwrap(), Value::Int(20));
        assert_eq!(NamedProperty::RowTime.value(&w).unwrap(), Value::Int(19));
        assert_eq!(NamedProperty::ProcTime.value(&w).unwrap(), Value::Int(-1));

        assert!(matches!(
            NamedProperty::WindowStart.value(&CountWindow { id: 0 }),
            Err(Error::Config(_))
        ));
        assert_eq!(CountWindow { id: 3 }.max_timestamp(), MAX_TIMESTAMP);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(TumblingWindowAssigner::new(0, 0, true).is_err());
        assert!(CountTumblingWindowAssigner::new(-1).is_err());
    }
}
