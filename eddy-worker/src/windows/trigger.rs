use super::Window;
use crate::key_selector::GroupKey;
use crate::timer::{InternalTimerService, TimerOperandType, TimerService};
use crate::{Error, Result};
use eddy_state::{BackingStore, NamespaceCoder, StateStore};
use eddy_types::{Data, Row};
use std::fmt::Debug;

const COUNT_TRIGGER_TABLE: char = 'c';

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerResult {
    Continue,
    Fire,
    Purge,
    FireAndPurge,
}

impl TriggerResult {
    pub fn is_fire(&self) -> bool {
        matches!(self, TriggerResult::Fire | TriggerResult::FireAndPurge)
    }

    pub fn is_purge(&self) -> bool {
        matches!(self, TriggerResult::Purge | TriggerResult::FireAndPurge)
    }
}

/// What a trigger may touch while handling one window of the current key: timers for that
/// window and state scoped to it.
pub struct TriggerContext<'a, W: Window, S: BackingStore> {
    window: W,
    namespace: Vec<u8>,
    state: &'a mut StateStore<GroupKey, S>,
    timers: &'a mut InternalTimerService<W>,
}

impl<'a, W: Window, S: BackingStore> TriggerContext<'a, W, S> {
    pub fn new(
        window: W,
        state: &'a mut StateStore<GroupKey, S>,
        timers: &'a mut InternalTimerService<W>,
    ) -> Result<Self> {
        Ok(TriggerContext {
            window,
            namespace: NamespaceCoder.encode_nested(&window)?,
            state,
            timers,
        })
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    pub fn get_state<V: Data>(&mut self, table: char) -> Result<Option<V>> {
        Ok(self.state.get_value(table, &self.namespace)?)
    }

    pub fn put_state<V: Data>(&mut self, table: char, value: &V) -> Result<()> {
        Ok(self.state.put_value(table, &self.namespace, value)?)
    }

    pub fn clear_state(&mut self, table: char) -> Result<()> {
        Ok(self.state.remove_value(table, &self.namespace)?)
    }

    fn request(&mut self, operand: TimerOperandType, time: i64) -> Result<()> {
        self.timers
            .request(operand, self.state.current_key(), self.window, time)
    }
}

impl<W: Window, S: BackingStore> TimerService for TriggerContext<'_, W, S> {
    fn current_processing_time(&self) -> i64 {
        self.timers.current_processing_time()
    }

    fn current_watermark(&self) -> i64 {
        self.timers.current_watermark()
    }

    fn register_event_time_timer(&mut self, time: i64) -> Result<()> {
        self.request(TimerOperandType::RegisterEventTimer, time)
    }

    fn register_processing_time_timer(&mut self, time: i64) -> Result<()> {
        self.request(TimerOperandType::RegisterProcTimer, time)
    }

    fn delete_event_time_timer(&mut self, time: i64) -> Result<()> {
        self.request(TimerOperandType::DeleteEventTimer, time)
    }

    fn delete_processing_time_timer(&mut self, time: i64) -> Result<()> {
        self.request(TimerOperandType::DeleteProcTimer, time)
    }
}

/// Decides when a window emits its result.
pub trait Trigger<W: Window>: Debug + Send {
    fn on_element<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        element: &Row,
        timestamp: i64,
    ) -> Result<TriggerResult>;

    fn on_event_time<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        time: i64,
    ) -> Result<TriggerResult>;

    fn on_processing_time<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        time: i64,
    ) -> Result<TriggerResult>;

    /// Drops any timers and state the trigger holds for the context's window.
    fn clear<S: BackingStore>(&self, ctx: &mut TriggerContext<'_, W, S>) -> Result<()>;
}

/// Fires once the watermark passes the end of the window.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventTimeTrigger;

impl<W: Window> Trigger<W> for EventTimeTrigger {
    fn on_element<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        _element: &Row,
        _timestamp: i64,
    ) -> Result<TriggerResult> {
        let max_timestamp = ctx.window().max_timestamp();
        if max_timestamp <= ctx.current_watermark() {
            // late but within allowed lateness
            Ok(TriggerResult::Fire)
        } else {
            ctx.register_event_time_timer(max_timestamp)?;
            Ok(TriggerResult::Continue)
        }
    }

    fn on_event_time<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        time: i64,
    ) -> Result<TriggerResult> {
        if time == ctx.window().max_timestamp() {
            Ok(TriggerResult::Fire)
        } else {
            Ok(TriggerResult::Continue)
        }
    }

    fn on_processing_time<S: BackingStore>(
        &self,
        _ctx: &mut TriggerContext<'_, W, S>,
        _time: i64,
    ) -> Result<TriggerResult> {
        Ok(TriggerResult::Continue)
    }

    fn clear<S: BackingStore>(&self, ctx: &mut TriggerContext<'_, W, S>) -> Result<()> {
        let max_timestamp = ctx.window().max_timestamp();
        ctx.delete_event_time_timer(max_timestamp)
    }
}

/// Fires when processing time reaches the end of the window.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessingTimeTrigger;

impl<W: Window> Trigger<W> for ProcessingTimeTrigger {
    fn on_element<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        _element: &Row,
        _timestamp: i64,
    ) -> Result<TriggerResult> {
        let max_timestamp = ctx.window().max_timestamp();
        ctx.register_processing_time_timer(max_timestamp)?;
        Ok(TriggerResult::Continue)
    }

    fn on_event_time<S: BackingStore>(
        &self,
        _ctx: &mut TriggerContext<'_, W, S>,
        _time: i64,
    ) -> Result<TriggerResult> {
        Ok(TriggerResult::Continue)
    }

    fn on_processing_time<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        time: i64,
    ) -> Result<TriggerResult> {
        if time == ctx.window().max_timestamp() {
            Ok(TriggerResult::Fire)
        } else {
            Ok(TriggerResult::Continue)
        }
    }

    fn clear<S: BackingStore>(&self, ctx: &mut TriggerContext<'_, W, S>) -> Result<()> {
        let max_timestamp = ctx.window().max_timestamp();
        ctx.delete_processing_time_timer(max_timestamp)
    }
}

/// Fires and purges a window once it has seen `count` elements.
#[derive(Debug, Clone, Copy)]
pub struct CountTrigger {
    count: i64,
}

impl CountTrigger {
    pub fn new(count: i64) -> Result<Self> {
        if count <= 0 {
            return Err(Error::config("count trigger requires a positive count"));
        }
        Ok(CountTrigger { count })
    }
}

impl<W: Window> Trigger<W> for CountTrigger {
    fn on_element<S: BackingStore>(
        &self,
        ctx: &mut TriggerContext<'_, W, S>,
        _element: &Row,
        _timestamp: i64,
    ) -> Result<TriggerResult> {
        let seen: i64 = ctx.get_state(COUNT_TRIGGER_TABLE)?.unwrap_or(0) + 1;
        if seen >= self.count {
            ctx.clear_state(COUNT_TRIGGER_TABLE)?;
            Ok(TriggerResult::FireAndPurge)
        } else {
            ctx.put_state(COUNT_TRIGGER_TABLE, &seen)?;
            Ok(TriggerResult::Continue)
        }
    }

    fn on_event_time<S: BackingStore>(
        &self,
        _ctx: &mut TriggerContext<'_, W, S>,
        _time: i64,
    ) -> Result<TriggerResult> {
        Ok(TriggerResult::Continue)
    }

    fn on_processing_time<S: BackingStore>(
        &self,
        _ctx: &mut TriggerContext<'_, W, S>,
        _time: i64,
    ) -> Result<TriggerResult> {
        Ok(TriggerResult::Continue)
    }

    fn clear<S: BackingStore>(&self, ctx: &mut TriggerContext<'_, W, S>) -> Result<()> {
        ctx.clear_state(COUNT_TRIGGER_TABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;
    use crate::windows::{CountWindow, TimeWindow};
    use eddy_state::InMemoryBackend;
    use eddy_types::Value;
    use std::sync::Arc;

    fn setup<W: Window>() -> (StateStore<GroupKey, InMemoryBackend>, InternalTimerService<W>) {
        let mut state = StateStore::new(InMemoryBackend::default(), 10);
        state.set_current_key(vec![Value::from("k")]).unwrap();
        (state, InternalTimerService::new(Arc::new(ManualClock::new(0))))
    }

    #[test]
    fn test_event_time_trigger() {
        let (mut state, mut timers) = setup::<TimeWindow>();
        let window = TimeWindow::new(0, 10);
        let row = Row::insert(vec![]);

        let mut ctx = TriggerContext::new(window, &mut state, &mut timers).unwrap();
        assert_eq!(
            EventTimeTrigger.on_element(&mut ctx, &row, 3).unwrap(),
            TriggerResult::Continue
        );
        assert_eq!(
            EventTimeTrigger.on_event_time(&mut ctx, 9).unwrap(),
            TriggerResult::Fire
        );
        assert_eq!(
            EventTimeTrigger.on_event_time(&mut ctx, 10).unwrap(),
            TriggerResult::Continue
        );
        drop(ctx);

        let requests = timers.drain();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, TimerOperandType::RegisterEventTimer);
        assert_eq!(requests[0].1.timestamp, 9);
        assert_eq!(requests[0].1.namespace, window);

        timers.advance_watermark(20);
        let mut ctx = TriggerContext::new(window, &mut state, &mut timers).unwrap();
        assert_eq!(
            EventTimeTrigger.on_element(&mut ctx, &row, 3).unwrap(),
            TriggerResult::Fire
        );
    }

    #[test]
    fn test_count_trigger_fires_and_purges() {
        let (mut state, mut timers) = setup::<CountWindow>();
        let trigger = CountTrigger::new(2).unwrap();
        let row = Row::insert(vec![]);
        let mut ctx = TriggerContext::new(CountWindow { id: 0 }, &mut state, &mut timers).unwrap();

        assert_eq!(
            trigger.on_element(&mut ctx, &row, 0).unwrap(),
            TriggerResult::Continue
        );
        let result = trigger.on_element(&mut ctx, &row, 0).unwrap();
        assert!(result.is_fire() && result.is_purge());
        assert_eq!(ctx.get_state::<i64>(COUNT_TRIGGER_TABLE).unwrap(), None);
    }

    #[test]
    fn test_processing_time_trigger() {
        let (mut state, mut timers) = setup::<TimeWindow>();
        let window = TimeWindow::new(100, 200);
        let mut ctx = TriggerContext::new(window, &mut state, &mut timers).unwrap();

        ProcessingTimeTrigger
            .on_element(&mut ctx, &Row::insert(vec![]), 150)
            .unwrap();
        assert_eq!(
            ProcessingTimeTrigger.on_processing_time(&mut ctx, 199).unwrap(),
            TriggerResult::Fire
        );
        ProcessingTimeTrigger.clear(&mut ctx).unwrap();
        drop(ctx);

        let ops: Vec<_> = timers.drain().into_iter().map(|(op, _)| op).collect();
        assert_eq!(
            ops,
            vec![
                TimerOperandType::RegisterProcTimer,
                TimerOperandType::DeleteProcTimer
            ]
        );
    }
}
