use crate::aggregates::{Accumulator, FunctionContext, TableAggregateFunction};
use crate::key_selector::{field, GroupKey, KeySelector};
use crate::Result;
use bincode::{Decode, Encode};
use eddy_state::{BackingStore, StateStore, VOID_NAMESPACE};
use eddy_types::{Row, RowKind, Value};
use tracing::warn;

const ACCUMULATOR_TABLE: char = 'a';

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct TableAccumulator {
    acc: Accumulator,
    count: i64,
}

/// Grouped aggregation whose function emits a set of rows per key. Every change replaces
/// the key's previous rows.
pub struct GroupTableAggFunction<S: BackingStore> {
    function: Box<dyn TableAggregateFunction>,
    inputs: Vec<usize>,
    key_selector: KeySelector,
    state: StateStore<GroupKey, S>,
    generate_update_before: bool,
    buffer: Vec<Row>,
}

impl<S: BackingStore> GroupTableAggFunction<S> {
    pub fn new(
        function: Box<dyn TableAggregateFunction>,
        inputs: Vec<usize>,
        key_selector: KeySelector,
        state: StateStore<GroupKey, S>,
        generate_update_before: bool,
    ) -> Self {
        GroupTableAggFunction {
            function,
            inputs,
            key_selector,
            state,
            generate_update_before,
            buffer: vec![],
        }
    }

    pub fn open(&mut self, ctx: &FunctionContext<'_>) -> Result<()> {
        self.function.open(ctx)
    }

    pub fn close(&mut self) -> Result<()> {
        self.function.close()
    }

    fn emit(&mut self, kind: RowKind, key: &GroupKey, acc: &Accumulator) -> Result<()> {
        for values in self.function.emit_value(acc)? {
            self.buffer.push(Row::join(kind, key, values));
        }
        Ok(())
    }

    pub fn process_element(&mut self, row: &Row) -> Result<()> {
        let key = self.key_selector.get_key(row)?;
        self.state.set_current_key(key.clone())?;

        let existing: Option<TableAccumulator> =
            self.state.get_value(ACCUMULATOR_TABLE, VOID_NAMESPACE)?;
        let (mut state, first_row) = match existing {
            Some(state) => (state, false),
            None if row.kind.is_retract() => {
                warn!("dropping retraction for key {:?} without state", key);
                return Ok(());
            }
            None => (
                TableAccumulator {
                    acc: self.function.create_accumulator(),
                    count: 0,
                },
                true,
            ),
        };

        if !first_row && self.generate_update_before {
            self.emit(RowKind::Delete, &key, &state.acc)?;
        }
        let previous = (!first_row && !self.generate_update_before).then(|| state.acc.clone());

        let args = self
            .inputs
            .iter()
            .map(|idx| field(row, *idx).cloned())
            .collect::<Result<Vec<Value>>>()?;
        if row.kind.is_accumulate() {
            self.function.accumulate(&mut state.acc, &args)?;
            state.count += 1;
        } else {
            self.function.retract(&mut state.acc, &args)?;
            state.count -= 1;
        }

        if state.count != 0 {
            self.emit(RowKind::Insert, &key, &state.acc)?;
            self.state
                .put_value(ACCUMULATOR_TABLE, VOID_NAMESPACE, &state)?;
        } else {
            // without update-before the old rows were never retracted
            if let Some(previous) = previous {
                self.emit(RowKind::Delete, &key, &previous)?;
            }
            self.state.remove_value(ACCUMULATOR_TABLE, VOID_NAMESPACE)?;
        }
        Ok(())
    }

    pub fn finish_bundle(&mut self) -> Result<Vec<Row>> {
        self.state.flush()?;
        Ok(std::mem::take(&mut self.buffer))
    }

    pub fn state(&self) -> &StateStore<GroupKey, S> {
        &self.state
    }
}
