use super::{NamedProperty, Trigger, TriggerContext, Window, WindowAssigner};
use crate::aggregates::FunctionContext;
use crate::aggs_handle::{AccumulatorSet, AggsHandle};
use crate::key_selector::{field, GroupKey, KeySelector};
use crate::timer::{Clock, InternalTimer, InternalTimerService, TimerOperandType};
use crate::{Error, Result};
use eddy_state::{BackingStore, NamespaceCoder, StateStore};
use eddy_types::{Row, RowKind, Value, MAX_TIMESTAMP};
use prometheus::IntCounter;
use std::sync::Arc;
use tracing::{debug, warn};

const WINDOW_ACCUMULATOR_TABLE: char = 'w';
const WINDOW_EMITTED_TABLE: char = 'e';

#[derive(Debug, Clone, Default)]
pub struct WindowOptions {
    pub allowed_lateness: i64,
    /// Field holding the event timestamp; processing time is used when absent.
    pub rowtime_index: Option<usize>,
    pub named_properties: Vec<NamedProperty>,
    pub generate_update_before: bool,
}

/// Aggregates each key per window. Rows are assigned to windows on arrival, and results
/// leave when the trigger fires, either on the element itself or on a timer.
pub struct GroupWindowAggFunction<W, A, T, S>
where
    W: Window,
    A: WindowAssigner<W>,
    T: Trigger<W>,
    S: BackingStore,
{
    aggs: AggsHandle,
    key_selector: KeySelector,
    assigner: A,
    trigger: T,
    state: StateStore<GroupKey, S>,
    timers: InternalTimerService<W>,
    options: WindowOptions,
    cleanups: Option<IntCounter>,
}

impl<W, A, T, S> GroupWindowAggFunction<W, A, T, S>
where
    W: Window,
    A: WindowAssigner<W>,
    T: Trigger<W>,
    S: BackingStore,
{
    pub fn new(
        aggs: AggsHandle,
        key_selector: KeySelector,
        assigner: A,
        trigger: T,
        state: StateStore<GroupKey, S>,
        clock: Arc<dyn Clock>,
        options: WindowOptions,
    ) -> Self {
        GroupWindowAggFunction {
            aggs,
            key_selector,
            assigner,
            trigger,
            state,
            timers: InternalTimerService::new(clock),
            options,
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

    pub fn process_watermark(&mut self, watermark: i64) {
        self.timers.advance_watermark(watermark);
    }

    pub fn current_watermark(&self) -> i64 {
        self.timers.current_watermark()
    }

    fn element_timestamp(&self, row: &Row) -> Result<i64> {
        match self.options.rowtime_index {
            Some(idx) => match field(row, idx)? {
                Value::Int(ts) => Ok(*ts),
                other => Err(Error::invalid_input(format!(
                    "row time field {} does not hold a timestamp: {:?}",
                    idx, other
                ))),
            },
            None => Ok(self.timers.current_processing_time()),
        }
    }

    fn cleanup_time(&self, window: &W) -> i64 {
        if self.assigner.is_event_time() {
            window
                .max_timestamp()
                .saturating_add(self.options.allowed_lateness)
        } else {
            window.max_timestamp()
        }
    }

    fn is_late(&self, window: &W) -> bool {
        self.assigner.is_event_time() && self.cleanup_time(window) <= self.timers.current_watermark()
    }

    fn cleanup_timer(&mut self, window: W, register: bool) -> Result<()> {
        let time = self.cleanup_time(&window);
        if time == MAX_TIMESTAMP {
            return Ok(());
        }
        let operand = match (self.assigner.is_event_time(), register) {
            (true, true) => TimerOperandType::RegisterEventTimer,
            (false, true) => TimerOperandType::RegisterProcTimer,
            (true, false) => TimerOperandType::DeleteEventTimer,
            (false, false) => TimerOperandType::DeleteProcTimer,
        };
        self.timers
            .request(operand, self.state.current_key(), window, time)
    }

    pub fn process_element(&mut self, row: &Row) -> Result<Vec<Row>> {
        let key = self.key_selector.get_key(row)?;
        self.state.set_current_key(key.clone())?;
        let timestamp = self.element_timestamp(row)?;

        let mut windows = vec![];
        for window in self.assigner.assign_windows(&mut self.state, row, timestamp)? {
            if self.is_late(&window) {
                warn!(
                    "dropping element at {} for expired window {:?} (watermark {})",
                    timestamp,
                    window,
                    self.timers.current_watermark()
                );
                continue;
            }

            let namespace = NamespaceCoder.encode_nested(&window)?;
            let accs: Option<AccumulatorSet> =
                self.state.get_value(WINDOW_ACCUMULATOR_TABLE, &namespace)?;
            // a fully retracted window behaves as if it had no state
            let accs = accs.filter(|accs| !self.aggs.record_count_is_zero(accs));
            let mut accs = match accs {
                Some(accs) => accs,
                None if row.kind.is_retract() => {
                    warn!("dropping retraction for window {:?} without state", window);
                    continue;
                }
                None => self.aggs.create_accumulators(),
            };
            self.aggs.apply(&mut accs, row)?;
            self.state
                .put_value(WINDOW_ACCUMULATOR_TABLE, &namespace, &accs)?;
            windows.push(window);
        }

        let mut output = vec![];
        for window in windows {
            let result = {
                let mut ctx = TriggerContext::new(window, &mut self.state, &mut self.timers)?;
                self.trigger.on_element(&mut ctx, row, timestamp)?
            };

            if result.is_fire() {
                self.emit_window_result(&key, window, &mut output)?;
            }

            if result.is_purge() {
                self.clear_window(window)?;
                self.cleanup_timer(window, false)?;
            } else {
                self.cleanup_timer(window, true)?;
            }
        }

        Ok(output)
    }

    fn emit_window_result(&mut self, key: &GroupKey, window: W, output: &mut Vec<Row>) -> Result<()> {
        let namespace = NamespaceCoder.encode_nested(&window)?;
        let accs: Option<AccumulatorSet> =
            self.state.get_value(WINDOW_ACCUMULATOR_TABLE, &namespace)?;
        let Some(accs) = accs else {
            return Ok(());
        };
        debug!("window {:?} fired for key {:?}", window, key);
        let previous: Option<Vec<Value>> =
            self.state.get_value(WINDOW_EMITTED_TABLE, &namespace)?;

        if self.aggs.record_count_is_zero(&accs) {
            if let Some(previous) = previous {
                output.push(Row::join(RowKind::Delete, key, previous));
                self.state.remove_value(WINDOW_EMITTED_TABLE, &namespace)?;
            }
            return Ok(());
        }

        let mut current = self.aggs.get_value(&accs)?;
        for property in &self.options.named_properties {
            current.push(property.value(&window)?);
        }

        match previous {
            None => output.push(Row::join(RowKind::Insert, key, current.clone())),
            Some(previous) if previous == current => return Ok(()),
            Some(previous) => {
                if self.options.generate_update_before {
                    output.push(Row::join(RowKind::UpdateBefore, key, previous));
                }
                output.push(Row::join(RowKind::UpdateAfter, key, current.clone()));
            }
        }

        self.state
            .put_value(WINDOW_EMITTED_TABLE, &namespace, &current)?;
        Ok(())
    }

    fn clear_window(&mut self, window: W) -> Result<()> {
        let namespace = NamespaceCoder.encode_nested(&window)?;
        self.state
            .remove_value(WINDOW_ACCUMULATOR_TABLE, &namespace)?;
        self.state.remove_value(WINDOW_EMITTED_TABLE, &namespace)?;
        let mut ctx = TriggerContext::new(window, &mut self.state, &mut self.timers)?;
        self.trigger.clear(&mut ctx)?;
        if let Some(c) = &self.cleanups {
            c.inc();
        }
        Ok(())
    }

    pub fn on_event_time(&mut self, timer: InternalTimer<W>) -> Result<Vec<Row>> {
        self.on_timer(timer, true)
    }

    pub fn on_processing_time(&mut self, timer: InternalTimer<W>) -> Result<Vec<Row>> {
        self.on_timer(timer, false)
    }

    fn on_timer(&mut self, timer: InternalTimer<W>, event_time: bool) -> Result<Vec<Row>> {
        self.state.set_current_key(timer.key.clone())?;
        let window = timer.namespace;

        let result = {
            let mut ctx = TriggerContext::new(window, &mut self.state, &mut self.timers)?;
            if event_time {
                self.trigger.on_event_time(&mut ctx, timer.timestamp)?
            } else {
                self.trigger.on_processing_time(&mut ctx, timer.timestamp)?
            }
        };

        let mut output = vec![];
        if result.is_fire() {
            self.emit_window_result(&timer.key, window, &mut output)?;
        }

        if result.is_purge() {
            self.clear_window(window)?;
        } else if event_time == self.assigner.is_event_time()
            && timer.timestamp == self.cleanup_time(&window)
        {
            debug!("cleaning up window {:?} at {}", window, timer.timestamp);
            self.clear_window(window)?;
        }

        Ok(output)
    }

    pub fn get_timers(&mut self) -> Vec<(TimerOperandType, InternalTimer<W>)> {
        self.timers.drain()
    }

    pub fn finish_bundle(&mut self) -> Result<()> {
        Ok(self.state.flush()?)
    }

    pub fn state(&self) -> &StateStore<GroupKey, S> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::{AggregateKind, FunctionRegistry};
    use crate::config::AggregateCall;
    use crate::timer::ManualClock;
    use crate::windows::{
        CountTrigger, CountTumblingWindowAssigner, CountWindow, EventTimeTrigger, TimeWindow,
        TumblingWindowAssigner,
    };
    use eddy_state::InMemoryBackend;

    type EventTimeAgg =
        GroupWindowAggFunction<TimeWindow, TumblingWindowAssigner, EventTimeTrigger, InMemoryBackend>;

    fn sum_handle() -> AggsHandle {
        let calls = vec![
            AggregateCall::new(AggregateKind::Sum, vec![1]),
            AggregateCall::new(AggregateKind::CountStar, vec![]),
        ];
        AggsHandle::new(&calls, &FunctionRegistry::default(), Some(1), true).unwrap()
    }

    fn event_time_sum(allowed_lateness: i64) -> EventTimeAgg {
        GroupWindowAggFunction::new(
            sum_handle(),
            KeySelector::new(vec![0]),
            TumblingWindowAssigner::new(10, 0, true).unwrap(),
            EventTimeTrigger,
            StateStore::new(InMemoryBackend::default(), 100),
            Arc::new(ManualClock::new(0)),
            WindowOptions {
                allowed_lateness,
                rowtime_index: Some(2),
                named_properties: vec![NamedProperty::WindowStart, NamedProperty::WindowEnd],
                generate_update_before: true,
            },
        )
    }

    fn input(kind: RowKind, v: i64, ts: i64) -> Row {
        Row::new(kind, vec![Value::from("k"), Value::Int(v), Value::Int(ts)])
    }

    fn result(kind: RowKind, sum: i64, start: i64) -> Row {
        Row::new(
            kind,
            vec![
                Value::from("k"),
                Value::Int(sum),
                Value::Int(start),
                Value::Int(start + 10),
            ],
        )
    }

    fn timer(ts: i64, window: TimeWindow) -> InternalTimer<TimeWindow> {
        InternalTimer {
            timestamp: ts,
            key: vec![Value::from("k")],
            namespace: window,
        }
    }

    #[test]
    fn test_fires_at_window_end() {
        let mut f = event_time_sum(0);
        assert!(f.process_element(&input(RowKind::Insert, 1, 3)).unwrap().is_empty());
        assert!(f.process_element(&input(RowKind::Insert, 2, 9)).unwrap().is_empty());
        assert!(f.process_element(&input(RowKind::Insert, 4, 10)).unwrap().is_empty());

        let timers = f.get_timers();
        assert!(timers
            .iter()
            .all(|(op, _)| *op == TimerOperandType::RegisterEventTimer));
        let fire_times: Vec<i64> = timers.iter().map(|(_, t)| t.timestamp).collect();
        // trigger and cleanup coincide without lateness
        assert_eq!(fire_times, vec![9, 19]);

        f.process_watermark(9);
        let out = f.on_event_time(timer(9, TimeWindow::new(0, 10))).unwrap();
        assert_eq!(out, vec![result(RowKind::Insert, 3, 0)]);

        let out = f.on_event_time(timer(19, TimeWindow::new(10, 20))).unwrap();
        assert_eq!(out, vec![result(RowKind::Insert, 4, 10)]);

        // the delete requests from trigger cleanup
        assert_eq!(f.get_timers().len(), 2);
        f.finish_bundle().unwrap();
        assert_eq!(f.state().backend().len(), 0);
    }

    #[test]
    fn test_late_firing_within_allowed_lateness() {
        let mut f = event_time_sum(5);
        f.process_element(&input(RowKind::Insert, 1, 3)).unwrap();
        f.process_watermark(9);
        let out = f.on_event_time(timer(9, TimeWindow::new(0, 10))).unwrap();
        assert_eq!(out, vec![result(RowKind::Insert, 1, 0)]);

        // late, but the window is still retained
        let out = f.process_element(&input(RowKind::Insert, 2, 4)).unwrap();
        assert_eq!(
            out,
            vec![
                result(RowKind::UpdateBefore, 1, 0),
                result(RowKind::UpdateAfter, 3, 0)
            ]
        );

        // cleanup at max timestamp + lateness
        assert!(f.on_event_time(timer(14, TimeWindow::new(0, 10))).unwrap().is_empty());
        f.process_watermark(14);
        assert!(f.process_element(&input(RowKind::Insert, 5, 4)).unwrap().is_empty());
        f.finish_bundle().unwrap();
        assert!(f.state().backend().is_empty());
    }

    #[test]
    fn test_retraction_into_emptied_window_is_dropped() {
        let mut f = event_time_sum(0);
        f.process_element(&input(RowKind::Insert, 1, 3)).unwrap();
        f.process_element(&input(RowKind::Delete, 1, 3)).unwrap();
        f.process_element(&input(RowKind::Delete, 1, 5)).unwrap();
        f.process_element(&input(RowKind::Insert, 4, 7)).unwrap();

        f.process_watermark(9);
        let out = f.on_event_time(timer(9, TimeWindow::new(0, 10))).unwrap();
        assert_eq!(out, vec![result(RowKind::Insert, 4, 0)]);
    }

    #[test]
    fn test_count_windows_emit_every_n_elements() {
        let calls = vec![AggregateCall::new(AggregateKind::Sum, vec![1])];
        let aggs = AggsHandle::new(&calls, &FunctionRegistry::default(), None, false).unwrap();
        let mut f = GroupWindowAggFunction::<CountWindow, _, _, _>::new(
            aggs,
            KeySelector::new(vec![0]),
            CountTumblingWindowAssigner::new(2).unwrap(),
            CountTrigger::new(2).unwrap(),
            StateStore::new(InMemoryBackend::default(), 100),
            Arc::new(ManualClock::new(0)),
            WindowOptions::default(),
        );

        let mut out = vec![];
        for v in 1..=5 {
            out.extend(f.process_element(&input(RowKind::Insert, v, 0)).unwrap());
        }
        assert_eq!(
            out,
            vec![
                Row::insert(vec![Value::from("k"), Value::Int(3)]),
                Row::insert(vec![Value::from("k"), Value::Int(7)]),
            ]
        );
        // count windows never end, so no timers
        assert!(f.get_timers().is_empty());
    }

    #[test]
    fn test_non_numeric_rowtime_is_rejected() {
        let mut f = event_time_sum(0);
        let row = Row::insert(vec![Value::from("k"), Value::Int(1), Value::from("noon")]);
        assert!(matches!(
            f.process_element(&row),
            Err(Error::InvalidInput(_))
        ));
    }
}
