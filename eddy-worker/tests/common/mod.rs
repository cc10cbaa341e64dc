#![allow(dead_code)]

use eddy_state::{BackingStore, InMemoryBackend, TimeDomain, TimerEntry, TimerQueue};
use eddy_types::{Row, RowKind, Value};
use eddy_worker::timer::{ManualClock, TimerOperandType};
use eddy_worker::{GroupKey, Input, Operation, OperationBuilder, Output, TimerPayload};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// In-memory backend that the test keeps a handle to after the operation takes ownership.
#[derive(Debug, Clone, Default)]
pub struct SharedBackend(pub Rc<RefCell<InMemoryBackend>>);

impl SharedBackend {
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

impl BackingStore for SharedBackend {
    fn get(&self, table: char, key: &[u8], namespace: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.0.borrow().get(table, key, namespace)
    }

    fn put(&mut self, table: char, key: &[u8], namespace: &[u8], value: Vec<u8>) -> anyhow::Result<()> {
        self.0.borrow_mut().put(table, key, namespace, value)
    }

    fn remove(&mut self, table: char, key: &[u8], namespace: &[u8]) -> anyhow::Result<()> {
        self.0.borrow_mut().remove(table, key, namespace)
    }

    fn namespaces(&self, table: char, key: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        self.0.borrow().namespaces(table, key)
    }
}

/// Plays the runner: feeds batches, keeps the durable timer queue, and fires due timers
/// back into the operation.
pub struct Driver {
    pub op: Box<dyn Operation>,
    pub timers: TimerQueue<GroupKey>,
    pub clock: Arc<ManualClock>,
    pub backend: SharedBackend,
    watermark: Option<i64>,
}

impl Driver {
    pub fn new(json: &str) -> Self {
        Self::with_builder(OperationBuilder::from_json(json).unwrap())
    }

    pub fn with_builder(builder: OperationBuilder) -> Self {
        eddy_worker::logging::init_logging("eddy-worker-tests");
        let clock = Arc::new(ManualClock::new(0));
        let backend = SharedBackend::default();
        let mut op = builder
            .with_clock(clock.clone())
            .build(backend.clone())
            .unwrap();
        op.open().unwrap();
        Driver {
            op,
            timers: TimerQueue::default(),
            clock,
            backend,
            watermark: None,
        }
    }

    fn apply(&mut self, outputs: Vec<Output>) -> Vec<Row> {
        let mut rows = vec![];
        for output in outputs {
            match output {
                Output::Record(row) => rows.push(row),
                Output::Timer(request) => {
                    let domain = if request.operand.is_event_time() {
                        TimeDomain::EventTime
                    } else {
                        TimeDomain::ProcessingTime
                    };
                    let entry = TimerEntry::new(request.timestamp, request.key, request.namespace);
                    match request.operand {
                        TimerOperandType::RegisterEventTimer | TimerOperandType::RegisterProcTimer => {
                            self.timers.register(domain, entry);
                        }
                        TimerOperandType::DeleteEventTimer | TimerOperandType::DeleteProcTimer => {
                            self.timers.delete(domain, &entry);
                        }
                    }
                }
            }
        }
        rows
    }

    pub fn send(&mut self, rows: Vec<Row>) -> Vec<Row> {
        let inputs = rows
            .into_iter()
            .map(|row| Input::Record {
                row,
                watermark: self.watermark,
            })
            .collect();
        let outputs = self.op.process_element_or_timer(inputs).unwrap();
        self.apply(outputs)
    }

    fn fire(&mut self, domain: TimeDomain, time: i64) -> Vec<Row> {
        let kind = match domain {
            TimeDomain::EventTime => TimerOperandType::RegisterEventTimer,
            TimeDomain::ProcessingTime => TimerOperandType::RegisterProcTimer,
        } as u8;

        let mut rows = vec![];
        loop {
            let due = self.timers.advance(domain, time);
            if due.is_empty() {
                break;
            }
            for timer in due {
                let outputs = self
                    .op
                    .process_element_or_timer(vec![Input::Timer {
                        timestamp: timer.timestamp,
                        payload: TimerPayload {
                            kind,
                            key: timer.key,
                            namespace: timer.namespace,
                        },
                    }])
                    .unwrap();
                rows.extend(self.apply(outputs));
            }
        }
        rows
    }

    pub fn advance_watermark(&mut self, watermark: i64) -> Vec<Row> {
        self.watermark = Some(watermark);
        self.fire(TimeDomain::EventTime, watermark)
    }

    pub fn advance_processing_time(&mut self, now: i64) -> Vec<Row> {
        self.clock.set(now);
        self.fire(TimeDomain::ProcessingTime, now)
    }

    pub fn finish(&mut self) -> Vec<Row> {
        let outputs = self.op.finish().unwrap();
        self.apply(outputs)
    }
}

pub fn row(kind: RowKind, values: Vec<Value>) -> Row {
    Row::new(kind, values)
}

pub fn keyed(kind: RowKind, key: &str, values: &[i64]) -> Row {
    let mut v = vec![Value::from(key)];
    v.extend(values.iter().map(|x| Value::Int(*x)));
    Row::new(kind, v)
}
