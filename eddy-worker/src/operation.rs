//! The batch-oriented surface the runner drives: inputs in, change records and timer
//! requests out.

use crate::aggregates::{FunctionContext, FunctionRegistry};
use crate::aggs_handle::AggsHandle;
use crate::config::{GroupAggConfig, OperationDescription};
use crate::group_agg::{GroupAggFunction, GroupAggOptions};
use crate::key_selector::{GroupKey, KeySelector};
use crate::table_agg::GroupTableAggFunction;
use crate::timer::{Clock, InternalTimer, SystemClock, TimerOperandType};
use crate::windows::{
    CountTrigger, CountTumblingWindowAssigner, CountWindow, EventTimeTrigger,
    GroupWindowAggFunction, ProcessingTimeTrigger, TimeWindow, Trigger, TumblingWindowAssigner,
    Window, WindowAssigner, WindowOptions,
};
use crate::{Error, Result};
use bincode::Encode;
use eddy_metrics::MetricsContext;
use eddy_state::{BackingStore, NamespaceCoder, StateStore};
use eddy_types::{Row, TaskInfo};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    NormalRecord = 0,
    TriggerTimer = 1,
}

impl TryFrom<u8> for ElementType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ElementType::NormalRecord),
            1 => Ok(ElementType::TriggerTimer),
            other => Err(Error::protocol(format!("unknown element type {}", other))),
        }
    }
}

/// A fired timer as handed back by the runner. `kind` is the raw operand code the timer was
/// registered with.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerPayload {
    pub kind: u8,
    pub key: GroupKey,
    pub namespace: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Record { row: Row, watermark: Option<i64> },
    Timer { timestamp: i64, payload: TimerPayload },
}

impl Input {
    pub fn record(row: Row) -> Self {
        Input::Record {
            row,
            watermark: None,
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Input::Record { .. } => ElementType::NormalRecord,
            Input::Timer { .. } => ElementType::TriggerTimer,
        }
    }

    /// Builds an input from its positional wire form.
    pub fn from_parts(
        element_type: u8,
        row: Option<Row>,
        timestamp: Option<i64>,
        watermark: Option<i64>,
        timer: Option<TimerPayload>,
    ) -> Result<Self> {
        match ElementType::try_from(element_type)? {
            ElementType::NormalRecord => {
                let row =
                    row.ok_or_else(|| Error::protocol("record element without a row"))?;
                Ok(Input::Record { row, watermark })
            }
            ElementType::TriggerTimer => {
                let timestamp = timestamp
                    .ok_or_else(|| Error::protocol("timer element without a timestamp"))?;
                let payload =
                    timer.ok_or_else(|| Error::protocol("timer element without a payload"))?;
                Ok(Input::Timer { timestamp, payload })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    pub operand: TimerOperandType,
    pub key: GroupKey,
    pub timestamp: i64,
    pub namespace: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Record(Row),
    Timer(TimerRequest),
}

/// A stateful aggregation driven in batches.
pub trait Operation {
    fn open(&mut self) -> Result<()>;

    /// Processes a batch in order. Records produced by the batch come first, followed by the
    /// timer requests it made.
    fn process_element_or_timer(&mut self, inputs: Vec<Input>) -> Result<Vec<Output>>;

    /// Flushes state; returns anything still buffered.
    fn finish(&mut self) -> Result<Vec<Output>>;

    fn close(&mut self) -> Result<()>;

    fn metrics(&self) -> &MetricsContext;
}

fn fired_operand(payload: &TimerPayload) -> Result<TimerOperandType> {
    match TimerOperandType::try_from(payload.kind)? {
        op @ (TimerOperandType::RegisterEventTimer | TimerOperandType::RegisterProcTimer) => {
            Ok(op)
        }
        op => Err(Error::protocol(format!(
            "fired timer carries {:?}; only registered timers can fire",
            op
        ))),
    }
}

fn timer_outputs<N: Encode>(
    timers: Vec<(TimerOperandType, InternalTimer<N>)>,
) -> Result<Vec<Output>> {
    timers
        .into_iter()
        .map(|(operand, timer)| {
            Ok(Output::Timer(TimerRequest {
                operand,
                key: timer.key,
                timestamp: timer.timestamp,
                namespace: NamespaceCoder.encode_nested(&timer.namespace)?,
            }))
        })
        .collect()
}

fn record_outputs(metrics: &MetricsContext, rows: Vec<Row>) -> Vec<Output> {
    metrics.records_out.inc_by(rows.len() as u64);
    rows.into_iter().map(Output::Record).collect()
}

pub struct StreamGroupAggregateOperation<S: BackingStore> {
    function: GroupAggFunction<S>,
    task_info: TaskInfo,
    metrics: MetricsContext,
}

impl<S: BackingStore> Operation for StreamGroupAggregateOperation<S> {
    fn open(&mut self) -> Result<()> {
        info!("opening group aggregate {}", self.task_info.operator_id);
        self.function.open(&FunctionContext {
            task_info: &self.task_info,
            metrics: &self.metrics,
        })
    }

    fn process_element_or_timer(&mut self, inputs: Vec<Input>) -> Result<Vec<Output>> {
        for input in inputs {
            match input {
                Input::Record { row, .. } => {
                    self.metrics.records_in.inc();
                    self.function.process_element(&row)?;
                }
                Input::Timer { timestamp, payload } => {
                    self.metrics.timers_fired.inc();
                    fired_operand(&payload)?;
                    if !payload.namespace.is_empty() {
                        return Err(Error::protocol(
                            "group aggregate timers carry no namespace",
                        ));
                    }
                    self.function.on_timer(payload.key, timestamp)?;
                }
            }
        }

        let mut outputs = record_outputs(&self.metrics, self.function.finish_bundle()?);
        outputs.extend(timer_outputs(self.function.get_timers())?);
        Ok(outputs)
    }

    fn finish(&mut self) -> Result<Vec<Output>> {
        let mut outputs = record_outputs(&self.metrics, self.function.finish_bundle()?);
        outputs.extend(timer_outputs(self.function.get_timers())?);
        Ok(outputs)
    }

    fn close(&mut self) -> Result<()> {
        self.function.close()
    }

    fn metrics(&self) -> &MetricsContext {
        &self.metrics
    }
}

pub struct StreamGroupTableAggregateOperation<S: BackingStore> {
    function: GroupTableAggFunction<S>,
    task_info: TaskInfo,
    metrics: MetricsContext,
}

impl<S: BackingStore> Operation for StreamGroupTableAggregateOperation<S> {
    fn open(&mut self) -> Result<()> {
        info!("opening group table aggregate {}", self.task_info.operator_id);
        self.function.open(&FunctionContext {
            task_info: &self.task_info,
            metrics: &self.metrics,
        })
    }

    fn process_element_or_timer(&mut self, inputs: Vec<Input>) -> Result<Vec<Output>> {
        for input in inputs {
            match input {
                Input::Record { row, .. } => {
                    self.metrics.records_in.inc();
                    self.function.process_element(&row)?;
                }
                Input::Timer { .. } => {
                    return Err(Error::protocol(
                        "group table aggregate never registers timers",
                    ));
                }
            }
        }
        Ok(record_outputs(&self.metrics, self.function.finish_bundle()?))
    }

    fn finish(&mut self) -> Result<Vec<Output>> {
        Ok(record_outputs(&self.metrics, self.function.finish_bundle()?))
    }

    fn close(&mut self) -> Result<()> {
        self.function.close()
    }

    fn metrics(&self) -> &MetricsContext {
        &self.metrics
    }
}

enum WindowAggregation<S: BackingStore> {
    EventTime(GroupWindowAggFunction<TimeWindow, TumblingWindowAssigner, EventTimeTrigger, S>),
    ProcessingTime(
        GroupWindowAggFunction<TimeWindow, TumblingWindowAssigner, ProcessingTimeTrigger, S>,
    ),
    Count(GroupWindowAggFunction<CountWindow, CountTumblingWindowAssigner, CountTrigger, S>),
}

macro_rules! dispatch {
    ($aggregation:expr, $f:ident => $body:expr) => {
        match $aggregation {
            WindowAggregation::EventTime($f) => $body,
            WindowAggregation::ProcessingTime($f) => $body,
            WindowAggregation::Count($f) => $body,
        }
    };
}

fn process_window_input<W, A, T, S>(
    f: &mut GroupWindowAggFunction<W, A, T, S>,
    metrics: &MetricsContext,
    input: Input,
) -> Result<Vec<Output>>
where
    W: Window,
    A: WindowAssigner<W>,
    T: Trigger<W>,
    S: BackingStore,
{
    let rows = match input {
        Input::Record { row, watermark } => {
            metrics.records_in.inc();
            if let Some(watermark) = watermark {
                f.process_watermark(watermark);
            }
            f.process_element(&row)?
        }
        Input::Timer { timestamp, payload } => {
            metrics.timers_fired.inc();
            let operand = fired_operand(&payload)?;
            let window: W = NamespaceCoder
                .decode_nested(&payload.namespace)
                .map_err(|e| Error::protocol(format!("malformed timer namespace: {}", e)))?;
            let timer = InternalTimer {
                timestamp,
                key: payload.key,
                namespace: window,
            };
            debug!("timer {:?} fired for window {:?} at {}", operand, window, timestamp);
            if operand == TimerOperandType::RegisterEventTimer {
                // an event timer only fires once the watermark has reached it
                f.process_watermark(timestamp);
                f.on_event_time(timer)?
            } else {
                f.on_processing_time(timer)?
            }
        }
    };

    let mut outputs = record_outputs(metrics, rows);
    outputs.extend(timer_outputs(f.get_timers())?);
    Ok(outputs)
}

pub struct StreamGroupWindowAggregateOperation<S: BackingStore> {
    aggregation: WindowAggregation<S>,
    task_info: TaskInfo,
    metrics: MetricsContext,
}

impl<S: BackingStore> Operation for StreamGroupWindowAggregateOperation<S> {
    fn open(&mut self) -> Result<()> {
        info!("opening group window aggregate {}", self.task_info.operator_id);
        let ctx = FunctionContext {
            task_info: &self.task_info,
            metrics: &self.metrics,
        };
        dispatch!(&mut self.aggregation, f => f.open(&ctx))
    }

    fn process_element_or_timer(&mut self, inputs: Vec<Input>) -> Result<Vec<Output>> {
        let mut outputs = vec![];
        for input in inputs {
            let produced = dispatch!(&mut self.aggregation, f => process_window_input(f, &self.metrics, input))?;
            outputs.extend(produced);
        }
        dispatch!(&mut self.aggregation, f => f.finish_bundle())?;
        Ok(outputs)
    }

    fn finish(&mut self) -> Result<Vec<Output>> {
        dispatch!(&mut self.aggregation, f => f.finish_bundle())?;
        Ok(vec![])
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(&mut self.aggregation, f => f.close())
    }

    fn metrics(&self) -> &MetricsContext {
        &self.metrics
    }
}

/// Assembles an operation from its description.
pub struct OperationBuilder {
    description: OperationDescription,
    registry: FunctionRegistry,
    clock: Arc<dyn Clock>,
    task_info: Option<TaskInfo>,
}

impl OperationBuilder {
    pub fn new(description: OperationDescription) -> Self {
        OperationBuilder {
            description,
            registry: FunctionRegistry::default(),
            clock: Arc::new(SystemClock),
            task_info: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(OperationDescription::from_json(json)?))
    }

    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_task_info(mut self, task_info: TaskInfo) -> Self {
        self.task_info = Some(task_info);
        self
    }

    fn aggs_handle(&self, config: &GroupAggConfig) -> Result<AggsHandle> {
        AggsHandle::new(
            &config.aggregates,
            &self.registry,
            config.index_of_count_star,
            config.count_star_inserted,
        )
    }

    pub fn build<S: BackingStore + 'static>(self, backend: S) -> Result<Box<dyn Operation>> {
        self.description.validate()?;
        let base = self.description.base();

        let task_info = self.task_info.clone().unwrap_or_else(|| TaskInfo {
            job_id: "local".to_string(),
            operator_name: match &self.description {
                OperationDescription::GroupAggregate(_) => "group_aggregate",
                OperationDescription::GroupTableAggregate(_) => "group_table_aggregate",
                OperationDescription::GroupWindowAggregate(_) => "group_window_aggregate",
            }
            .to_string(),
            operator_id: base.operator_id.clone(),
            task_index: 0,
            parallelism: 1,
        });
        let metrics = MetricsContext::new(&task_info, base.metrics_enabled)
            .map_err(|e| Error::config(format!("failed to register metrics: {}", e)))?;

        let cache_size = base.resolved_state_cache_size()?;
        if cache_size == 0 {
            warn!("state cache size 0 is treated as 1");
        }
        let state = StateStore::new(backend, cache_size);
        let key_selector = KeySelector::new(base.grouping.clone());

        Ok(match &self.description {
            OperationDescription::GroupAggregate(config) => {
                let function = GroupAggFunction::new(
                    self.aggs_handle(config)?,
                    key_selector,
                    state,
                    self.clock.clone(),
                    GroupAggOptions {
                        generate_update_before: config.generate_update_before,
                        state_cleaning_enabled: config.state_cleaning_enabled,
                        suppress_unchanged_updates: config.suppress_unchanged_updates,
                        idle_state_retention_ms: config.idle_state_retention_ms,
                    },
                );
                Box::new(StreamGroupAggregateOperation {
                    function,
                    task_info,
                    metrics,
                })
            }
            OperationDescription::GroupTableAggregate(config) => {
                let function = GroupTableAggFunction::new(
                    self.registry.create_table(&config.table_aggregate.kind)?,
                    config.table_aggregate.inputs.clone(),
                    key_selector,
                    state,
                    config.base.generate_update_before,
                );
                Box::new(StreamGroupTableAggregateOperation {
                    function,
                    task_info,
                    metrics,
                })
            }
            OperationDescription::GroupWindowAggregate(config) => {
                let w = &config.window;
                let aggs = self.aggs_handle(&config.base)?;
                let options = WindowOptions {
                    allowed_lateness: w.allowed_lateness,
                    rowtime_index: if w.is_time_window && w.is_row_time {
                        w.time_field_index
                    } else {
                        None
                    },
                    named_properties: w.named_properties.clone(),
                    generate_update_before: config.base.generate_update_before,
                };
                let clock = self.clock.clone();

                let aggregation = if !w.is_time_window {
                    WindowAggregation::Count(GroupWindowAggFunction::new(
                        aggs,
                        key_selector,
                        CountTumblingWindowAssigner::new(w.size)?,
                        CountTrigger::new(w.size)?,
                        state,
                        clock,
                        options,
                    ))
                } else if w.is_row_time {
                    WindowAggregation::EventTime(GroupWindowAggFunction::new(
                        aggs,
                        key_selector,
                        TumblingWindowAssigner::new(w.size, w.offset, true)?,
                        EventTimeTrigger,
                        state,
                        clock,
                        options,
                    ))
                } else {
                    WindowAggregation::ProcessingTime(GroupWindowAggFunction::new(
                        aggs,
                        key_selector,
                        TumblingWindowAssigner::new(w.size, w.offset, false)?,
                        ProcessingTimeTrigger,
                        state,
                        clock,
                        options,
                    ))
                };

                Box::new(StreamGroupWindowAggregateOperation {
                    aggregation,
                    task_info,
                    metrics,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_state::InMemoryBackend;
    use eddy_types::{RowKind, Value};

    fn sum_operation() -> Box<dyn Operation> {
        OperationBuilder::from_json(
            r#"{
                "kind": "group_aggregate",
                "grouping": [0],
                "aggregates": [{"kind": "sum", "inputs": [1]}, {"kind": "count_star"}],
                "index_of_count_star": 1,
                "count_star_inserted": true,
                "metrics_enabled": true
            }"#,
        )
        .unwrap()
        .build(InMemoryBackend::default())
        .unwrap()
    }

    #[test]
    fn test_from_parts() {
        let row = Row::insert(vec![Value::Int(1)]);
        assert_eq!(
            Input::from_parts(0, Some(row.clone()), None, Some(5), None).unwrap(),
            Input::Record {
                row,
                watermark: Some(5)
            }
        );
        assert!(matches!(
            Input::from_parts(1, None, Some(10), None, None),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Input::from_parts(2, None, None, None, None),
            Err(Error::Protocol(_))
        ));
        assert_eq!(
            Input::record(Row::insert(vec![])).element_type(),
            ElementType::NormalRecord
        );
    }

    #[test]
    fn test_group_aggregate_batch() {
        let mut op = sum_operation();
        op.open().unwrap();
        let out = op
            .process_element_or_timer(vec![
                Input::record(Row::insert(vec![Value::from("A"), Value::Int(5)])),
                Input::record(Row::insert(vec![Value::from("A"), Value::Int(3)])),
            ])
            .unwrap();

        assert_eq!(
            out,
            vec![
                Output::Record(Row::insert(vec![Value::from("A"), Value::Int(5)])),
                Output::Record(Row::new(
                    RowKind::UpdateAfter,
                    vec![Value::from("A"), Value::Int(8)]
                )),
            ]
        );
        assert_eq!(op.metrics().records_in.get(), 2);
        assert_eq!(op.metrics().records_out.get(), 2);
        assert!(op.metrics().gather().contains("eddy_records_out"));
        assert!(op.finish().unwrap().is_empty());
        op.close().unwrap();
    }

    #[test]
    fn test_zero_state_cache_size_still_keeps_state() {
        let mut op = OperationBuilder::from_json(
            r#"{
                "kind": "group_aggregate",
                "grouping": [0],
                "aggregates": [{"kind": "sum", "inputs": [1]}],
                "state_cache_size": 0
            }"#,
        )
        .unwrap()
        .build(InMemoryBackend::default())
        .unwrap();
        op.open().unwrap();

        let mut rows = vec![];
        for (key, v) in [("A", 1), ("B", 10), ("A", 2), ("B", 20)] {
            let out = op
                .process_element_or_timer(vec![Input::record(Row::insert(vec![
                    Value::from(key),
                    Value::Int(v),
                ]))])
                .unwrap();
            rows.extend(out);
        }
        assert_eq!(
            rows.last(),
            Some(&Output::Record(Row::new(
                RowKind::UpdateAfter,
                vec![Value::from("B"), Value::Int(30)]
            )))
        );
        assert_eq!(
            rows[2],
            Output::Record(Row::new(
                RowKind::UpdateAfter,
                vec![Value::from("A"), Value::Int(3)]
            ))
        );
    }

    #[test]
    fn test_delete_operand_in_fired_timer_is_rejected() {
        let mut op = sum_operation();
        op.open().unwrap();
        let result = op.process_element_or_timer(vec![Input::Timer {
            timestamp: 10,
            payload: TimerPayload {
                kind: TimerOperandType::DeleteProcTimer as u8,
                key: vec![Value::from("A")],
                namespace: vec![],
            },
        }]);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
