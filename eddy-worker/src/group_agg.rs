use crate::aggregates::FunctionContext;
use crate::aggs_handle::{AccumulatorSet, AggsHandle};
use crate::key_selector::{GroupKey, KeySelector};
use crate::timer::{
    Clock, InternalTimer, InternalTimerService, KeyedTimerContext, TimerOperandType, TimerService,
};
use crate::Result;
use bincode::{Decode, Encode};
use eddy_state::{BackingStore, StateStore, VOID_NAMESPACE};
use eddy_types::{Row, RowKind};
use prometheus::IntCounter;
use std::sync::Arc;
use tracing::{debug, warn};

const ACCUMULATOR_TABLE: char = 'a';
const IDLE_TABLE: char = 'i';

/// Bookkeeping for idle-state retention: when the key was last touched and which cleanup
/// timer is outstanding.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct IdleState {
    last_touched: i64,
    timer: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct GroupAggOptions {
    pub generate_update_before: bool,
    pub state_cleaning_enabled: bool,
    pub suppress_unchanged_updates: bool,
    pub idle_state_retention_ms: Option<i64>,
}

impl Default for GroupAggOptions {
    fn default() -> Self {
        GroupAggOptions {
            generate_update_before: false,
            state_cleaning_enabled: true,
            suppress_unchanged_updates: false,
            idle_state_retention_ms: None,
        }
    }
}

/// Maintains one aggregate result per key and turns every input change into the changelog
/// rows that move downstream from the previous result to the new one.
pub struct GroupAggFunction<S: BackingStore> {
    aggs: AggsHandle,
    key_selector: KeySelector,
    state: StateStore<GroupKey, S>,
    timers: InternalTimerService<()>,
    options: GroupAggOptions,
    buffer: Vec<Row>,
    cleanups: Option<IntCounter>,
}

impl<S: BackingStore> GroupAggFunction<S> {
    pub fn new(
        aggs: AggsHandle,
        key_selector: KeySelector,
        state: StateStore<GroupKey, S>,
        clock: Arc<dyn Clock>,
        options: GroupAggOptions,
    ) -> Self {
        GroupAggFunction {
            aggs,
            key_selector,
            state,
            timers: InternalTimerService::new(clock),
            options,
            buffer: vec![],
            cleanups: None,
        }
    }

    pub fn open(&mut self, ctx: &FunctionContext<'_>) -> Result<()> {
        self.cleanups = Some(ctx.metrics.state_cleanups.clone());
        self.aggs.open(ctx)
    }

    pub fn close(&mut self) -> Result<()> {
        self.aggs.close()
    }

    fn load_accumulators(&mut self) -> Result<Option<AccumulatorSet>> {
        let accs: Option<AccumulatorSet> = self.state.get_value(ACCUMULATOR_TABLE, VOID_NAMESPACE)?;
        // a retained, fully retracted group behaves as if it had no state
        Ok(accs.filter(|accs| !self.aggs.record_count_is_zero(accs)))
    }

    pub fn process_element(&mut self, row: &Row) -> Result<()> {
        let key = self.key_selector.get_key(row)?;
        self.state.set_current_key(key.clone())?;

        let (mut accs, first_row) = match self.load_accumulators()? {
            Some(accs) => (accs, false),
            None if row.kind.is_retract() => {
                warn!("dropping retraction for key {:?} without state", key);
                return Ok(());
            }
            None => (self.aggs.create_accumulators(), true),
        };

        let previous = self.aggs.get_value(&accs)?;
        self.aggs.apply(&mut accs, row)?;
        let current = self.aggs.get_value(&accs)?;

        if !self.aggs.record_count_is_zero(&accs) {
            self.state.put_value(ACCUMULATOR_TABLE, VOID_NAMESPACE, &accs)?;
            self.touch()?;

            if first_row {
                self.buffer.push(Row::join(RowKind::Insert, &key, current));
                return Ok(());
            }

            if self.options.suppress_unchanged_updates
                && !self.options.state_cleaning_enabled
                && previous == current
            {
                return Ok(());
            }

            if self.options.generate_update_before {
                self.buffer
                    .push(Row::join(RowKind::UpdateBefore, &key, previous));
            }
            self.buffer
                .push(Row::join(RowKind::UpdateAfter, &key, current));
        } else {
            if !first_row {
                self.buffer.push(Row::join(RowKind::Delete, &key, previous));
            }

            if self.options.state_cleaning_enabled {
                self.clear_key()?;
            } else {
                self.state.put_value(ACCUMULATOR_TABLE, VOID_NAMESPACE, &accs)?;
            }
        }

        Ok(())
    }

    fn timer_context(&mut self) -> KeyedTimerContext<'_> {
        KeyedTimerContext {
            key: self.state.current_key(),
            timers: &mut self.timers,
        }
    }

    /// Records activity on the current key, scheduling an idle check if none is pending.
    fn touch(&mut self) -> Result<()> {
        let Some(retention) = self.retention() else {
            return Ok(());
        };

        let now = self.timers.current_processing_time();
        let idle: Option<IdleState> = self.state.get_value(IDLE_TABLE, VOID_NAMESPACE)?;
        let mut idle = idle.unwrap_or(IdleState {
            last_touched: now,
            timer: None,
        });
        idle.last_touched = now;

        if idle.timer.is_none() {
            let deadline = now.saturating_add(retention);
            self.timer_context().register_processing_time_timer(deadline)?;
            idle.timer = Some(deadline);
        }

        self.state.put_value(IDLE_TABLE, VOID_NAMESPACE, &idle)?;
        Ok(())
    }

    fn retention(&self) -> Option<i64> {
        if self.options.state_cleaning_enabled {
            self.options.idle_state_retention_ms
        } else {
            None
        }
    }

    fn clear_key(&mut self) -> Result<()> {
        self.state.remove_value(ACCUMULATOR_TABLE, VOID_NAMESPACE)?;
        if self.retention().is_some() {
            let idle: Option<IdleState> = self.state.get_value(IDLE_TABLE, VOID_NAMESPACE)?;
            if let Some(deadline) = idle.and_then(|idle| idle.timer) {
                self.timer_context().delete_processing_time_timer(deadline)?;
            }
            self.state.remove_value(IDLE_TABLE, VOID_NAMESPACE)?;
        }
        Ok(())
    }

    /// Idle-state check for `key`. Clears its state if it has not been touched for the
    /// retention period, otherwise schedules the next check.
    pub fn on_timer(&mut self, key: GroupKey, timestamp: i64) -> Result<()> {
        let Some(retention) = self.retention() else {
            return Ok(());
        };
        self.state.set_current_key(key)?;

        let idle: Option<IdleState> = self.state.get_value(IDLE_TABLE, VOID_NAMESPACE)?;
        let Some(mut idle) = idle else {
            debug!("ignoring idle timer at {} for a cleared key", timestamp);
            return Ok(());
        };
        if idle.timer != Some(timestamp) {
            debug!("ignoring stale idle timer at {}", timestamp);
            return Ok(());
        }

        let deadline = idle.last_touched.saturating_add(retention);
        if deadline <= timestamp {
            debug!("clearing idle state for key {:?}", self.state.current_key());
            self.state.remove_value(ACCUMULATOR_TABLE, VOID_NAMESPACE)?;
            self.state.remove_value(IDLE_TABLE, VOID_NAMESPACE)?;
            if let Some(c) = &self.cleanups {
                c.inc();
            }
        } else {
            self.timer_context().register_processing_time_timer(deadline)?;
            idle.timer = Some(deadline);
            self.state.put_value(IDLE_TABLE, VOID_NAMESPACE, &idle)?;
        }
        Ok(())
    }

    /// Flushes state and returns everything emitted since the last call.
    pub fn finish_bundle(&mut self) -> Result<Vec<Row>> {
        self.state.flush()?;
        Ok(std::mem::take(&mut self.buffer))
    }

    pub fn get_timers(&mut self) -> Vec<(TimerOperandType, InternalTimer<()>)> {
        self.timers.drain()
    }

    pub fn state(&self) -> &StateStore<GroupKey, S> {
        &self.state
    }
}
