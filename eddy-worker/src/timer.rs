use crate::key_selector::GroupKey;
use crate::{Error, Result};
use eddy_types::{to_millis, Key, MIN_WATERMARK};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Wire codes for timer requests. Fired timers come back with one of the register codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TimerOperandType {
    RegisterEventTimer = 0,
    RegisterProcTimer = 1,
    DeleteEventTimer = 2,
    DeleteProcTimer = 3,
}

impl TimerOperandType {
    pub fn is_event_time(&self) -> bool {
        matches!(
            self,
            TimerOperandType::RegisterEventTimer | TimerOperandType::DeleteEventTimer
        )
    }
}

impl TryFrom<u8> for TimerOperandType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => TimerOperandType::RegisterEventTimer,
            1 => TimerOperandType::RegisterProcTimer,
            2 => TimerOperandType::DeleteEventTimer,
            3 => TimerOperandType::DeleteProcTimer,
            other => {
                return Err(Error::protocol(format!(
                    "unknown timer operand type {}",
                    other
                )))
            }
        })
    }
}

pub trait Clock: Debug + Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        to_millis(SystemTime::now())
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        ManualClock {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternalTimer<N> {
    pub timestamp: i64,
    pub key: GroupKey,
    pub namespace: N,
}

/// Scheduling capabilities offered to functions and triggers. All timers are scoped to the
/// current key, and to the current window where there is one.
pub trait TimerService {
    fn current_processing_time(&self) -> i64;

    fn current_watermark(&self) -> i64;

    fn register_event_time_timer(&mut self, time: i64) -> Result<()>;

    fn register_processing_time_timer(&mut self, time: i64) -> Result<()>;

    fn delete_event_time_timer(&mut self, time: i64) -> Result<()>;

    fn delete_processing_time_timer(&mut self, time: i64) -> Result<()>;
}

/// Collects timer requests until the operation drains them, and holds the current watermark.
#[derive(Debug)]
pub struct InternalTimerService<N> {
    clock: Arc<dyn Clock>,
    watermark: i64,
    requests: Vec<(TimerOperandType, InternalTimer<N>)>,
}

impl<N: Key + Ord> InternalTimerService<N> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InternalTimerService {
            clock,
            watermark: MIN_WATERMARK,
            requests: vec![],
        }
    }

    pub fn current_processing_time(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn current_watermark(&self) -> i64 {
        self.watermark
    }

    pub fn advance_watermark(&mut self, watermark: i64) {
        if watermark > self.watermark {
            self.watermark = watermark;
        }
    }

    /// Queues a request for the given key. Within a batch the last request for a timer wins,
    /// so a later register replaces an earlier delete of the same timer and vice versa.
    pub fn request(
        &mut self,
        operand: TimerOperandType,
        key: Option<&GroupKey>,
        namespace: N,
        timestamp: i64,
    ) -> Result<()> {
        let key = key.ok_or_else(|| {
            Error::unsupported("timers can only be used in a keyed context")
        })?;
        let timer = InternalTimer {
            timestamp,
            key: key.clone(),
            namespace,
        };
        let before = self.requests.len();
        self.requests
            .retain(|(op, t)| op.is_event_time() != operand.is_event_time() || *t != timer);
        if self.requests.len() != before {
            debug!("{:?} at {} replaces an earlier request", operand, timestamp);
        }
        self.requests.push((operand, timer));
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<(TimerOperandType, InternalTimer<N>)> {
        std::mem::take(&mut self.requests)
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }
}

/// Timer access for non-windowed functions; timers carry no namespace.
pub struct KeyedTimerContext<'a> {
    pub(crate) key: Option<&'a GroupKey>,
    pub(crate) timers: &'a mut InternalTimerService<()>,
}

impl TimerService for KeyedTimerContext<'_> {
    fn current_processing_time(&self) -> i64 {
        self.timers.current_processing_time()
    }

    fn current_watermark(&self) -> i64 {
        self.timers.current_watermark()
    }

    fn register_event_time_timer(&mut self, time: i64) -> Result<()> {
        self.timers
            .request(TimerOperandType::RegisterEventTimer, self.key, (), time)
    }

    fn register_processing_time_timer(&mut self, time: i64) -> Result<()> {
        self.timers
            .request(TimerOperandType::RegisterProcTimer, self.key, (), time)
    }

    fn delete_event_time_timer(&mut self, time: i64) -> Result<()> {
        self.timers
            .request(TimerOperandType::DeleteEventTimer, self.key, (), time)
    }

    fn delete_processing_time_timer(&mut self, time: i64) -> Result<()> {
        self.timers
            .request(TimerOperandType::DeleteProcTimer, self.key, (), time)
    }
}
