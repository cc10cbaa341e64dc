use crate::aggregates::{
    Accumulator, AggregateFunction, AggregateKind, FunctionContext, FunctionRegistry,
};
use crate::config::AggregateCall;
use crate::key_selector::field;
use crate::{Error, Result};
use bincode::{Decode, Encode};
use eddy_types::{Row, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Tracks which argument tuples have been seen, so that distinct aggregates only observe
/// a value when it first appears and when it finally disappears. Each aggregate sharing
/// the view keeps its own count per tuple, because their filters may differ.
#[derive(Debug, Clone, PartialEq, Default, Encode, Decode)]
pub struct DistinctView {
    counts: BTreeMap<Vec<Value>, Vec<u64>>,
}

impl DistinctView {
    /// Returns true if this is the first occurrence of `args` for `slot`.
    fn add(&mut self, args: &[Value], slot: usize, width: usize) -> bool {
        let counts = self
            .counts
            .entry(args.to_vec())
            .or_insert_with(|| vec![0; width]);
        counts[slot] += 1;
        counts[slot] == 1
    }

    /// Returns true if the last occurrence of `args` for `slot` was just removed.
    fn remove(&mut self, args: &[Value], slot: usize) -> bool {
        let Some(counts) = self.counts.get_mut(args) else {
            return false;
        };
        if counts[slot] == 0 {
            return false;
        }
        counts[slot] -= 1;
        let gone = counts[slot] == 0;
        if counts.iter().all(|c| *c == 0) {
            self.counts.remove(args);
        }
        gone
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Distinct aggregates over the same input fields share one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinctViewDescriptor {
    pub input_fields: Vec<usize>,
    pub agg_indexes: Vec<usize>,
    pub filter_args: Vec<Option<usize>>,
}

impl DistinctViewDescriptor {
    fn slot(&self, agg_index: usize) -> Option<usize> {
        self.agg_indexes.iter().position(|i| *i == agg_index)
    }

    fn width(&self) -> usize {
        self.agg_indexes.len()
    }

    pub fn requires_filter_check(&self) -> bool {
        self.filter_args.iter().any(Option::is_some)
    }
}

/// Accumulators for every aggregate of a handle, persisted as one state value.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct AccumulatorSet {
    pub accumulators: Vec<Accumulator>,
    pub distinct_views: Vec<DistinctView>,
}

/// Drives a fixed list of aggregate calls over rows: extracts arguments, applies filters
/// and distinct deduplication, and exposes the combined result.
#[derive(Debug)]
pub struct AggsHandle {
    functions: Vec<Box<dyn AggregateFunction>>,
    calls: Vec<AggregateCall>,
    distinct_indexes: Vec<Option<usize>>,
    distinct_views: Vec<DistinctViewDescriptor>,
    index_of_count_star: Option<usize>,
    count_star_inserted: bool,
}

impl AggsHandle {
    pub fn new(
        calls: &[AggregateCall],
        registry: &FunctionRegistry,
        index_of_count_star: Option<usize>,
        count_star_inserted: bool,
    ) -> Result<Self> {
        if let Some(idx) = index_of_count_star {
            match calls.get(idx) {
                Some(call) if call.kind == AggregateKind::CountStar && call.filter_arg.is_none() => {}
                _ => {
                    return Err(Error::config(format!(
                        "index_of_count_star {} does not refer to an unfiltered count(*)",
                        idx
                    )))
                }
            }
        } else if count_star_inserted {
            return Err(Error::config(
                "count_star_inserted requires index_of_count_star",
            ));
        }

        let functions = calls
            .iter()
            .map(|call| registry.create(&call.kind))
            .collect::<Result<Vec<_>>>()?;

        let mut distinct_views: Vec<DistinctViewDescriptor> = vec![];
        let mut distinct_indexes = vec![None; calls.len()];
        for (i, call) in calls.iter().enumerate() {
            if !call.distinct {
                continue;
            }
            let view = match distinct_views
                .iter()
                .position(|d| d.input_fields == call.inputs)
            {
                Some(view) => view,
                None => {
                    distinct_views.push(DistinctViewDescriptor {
                        input_fields: call.inputs.clone(),
                        agg_indexes: vec![],
                        filter_args: vec![],
                    });
                    distinct_views.len() - 1
                }
            };
            distinct_views[view].agg_indexes.push(i);
            distinct_views[view].filter_args.push(call.filter_arg);
            distinct_indexes[i] = Some(view);
        }

        for view in &distinct_views {
            debug!(
                "distinct view over {:?} shared by aggregates {:?} (filtered: {})",
                view.input_fields,
                view.agg_indexes,
                view.requires_filter_check()
            );
        }

        Ok(AggsHandle {
            functions,
            calls: calls.to_vec(),
            distinct_indexes,
            distinct_views,
            index_of_count_star,
            count_star_inserted,
        })
    }

    pub fn open(&mut self, ctx: &FunctionContext<'_>) -> Result<()> {
        for f in &mut self.functions {
            f.open(ctx)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        for f in &mut self.functions {
            f.close()?;
        }
        Ok(())
    }

    pub fn create_accumulators(&self) -> AccumulatorSet {
        AccumulatorSet {
            accumulators: self
                .functions
                .iter()
                .map(|f| f.create_accumulator())
                .collect(),
            distinct_views: vec![DistinctView::default(); self.distinct_views.len()],
        }
    }

    fn args(&self, i: usize, row: &Row) -> Result<Vec<Value>> {
        self.calls[i]
            .inputs
            .iter()
            .map(|idx| field(row, *idx).cloned())
            .collect()
    }

    fn passes_filter(filter_arg: Option<usize>, row: &Row) -> Result<bool> {
        match filter_arg {
            None => Ok(true),
            Some(idx) => match field(row, idx)? {
                Value::Bool(b) => Ok(*b),
                Value::Null => Ok(false),
                other => Err(Error::invalid_input(format!(
                    "filter field {} is not a boolean: {:?}",
                    idx, other
                ))),
            },
        }
    }

    pub fn accumulate(&self, accs: &mut AccumulatorSet, row: &Row) -> Result<()> {
        for (i, f) in self.functions.iter().enumerate() {
            if !Self::passes_filter(self.calls[i].filter_arg, row)? {
                continue;
            }
            let args = self.args(i, row)?;
            if let Some(d) = self.distinct_indexes[i] {
                let view = &self.distinct_views[d];
                let Some(slot) = view.slot(i) else {
                    continue;
                };
                if !accs.distinct_views[d].add(&args, slot, view.width()) {
                    continue;
                }
            }
            f.accumulate(&mut accs.accumulators[i], &args)?;
        }
        Ok(())
    }

    pub fn retract(&self, accs: &mut AccumulatorSet, row: &Row) -> Result<()> {
        for (i, f) in self.functions.iter().enumerate() {
            if !Self::passes_filter(self.calls[i].filter_arg, row)? {
                continue;
            }
            let args = self.args(i, row)?;
            if let Some(d) = self.distinct_indexes[i] {
                let Some(slot) = self.distinct_views[d].slot(i) else {
                    continue;
                };
                if !accs.distinct_views[d].remove(&args, slot) {
                    continue;
                }
            }
            f.retract(&mut accs.accumulators[i], &args)?;
        }
        Ok(())
    }

    /// Applies `row` as an accumulation or retraction depending on its kind.
    pub fn apply(&self, accs: &mut AccumulatorSet, row: &Row) -> Result<()> {
        if row.kind.is_accumulate() {
            self.accumulate(accs, row)
        } else {
            self.retract(accs, row)
        }
    }

    pub fn merge(&self, accs: &mut AccumulatorSet, other: &AccumulatorSet) -> Result<()> {
        if !self.distinct_views.is_empty() {
            return Err(Error::unsupported(
                "merging accumulators of distinct aggregates",
            ));
        }
        for (i, f) in self.functions.iter().enumerate() {
            f.merge(&mut accs.accumulators[i], &other.accumulators[i])?;
        }
        Ok(())
    }

    /// Current result of every aggregate, minus an inserted count(*).
    pub fn get_value(&self, accs: &AccumulatorSet) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(self.functions.len());
        for (i, f) in self.functions.iter().enumerate() {
            if self.count_star_inserted && Some(i) == self.index_of_count_star {
                continue;
            }
            values.push(f.get_value(&accs.accumulators[i])?);
        }
        Ok(values)
    }

    /// True when every contributing row has been retracted. Without a count(*) there is
    /// no way to tell, so the group is never considered empty.
    pub fn record_count_is_zero(&self, accs: &AccumulatorSet) -> bool {
        match self.index_of_count_star {
            Some(i) => matches!(accs.accumulators.get(i), Some(Accumulator::Count(0))),
            None => false,
        }
    }

    pub fn index_of_count_star(&self) -> Option<usize> {
        self.index_of_count_star
    }

    pub fn count_star_inserted(&self) -> bool {
        self.count_star_inserted
    }

    pub fn distinct_views(&self) -> &[DistinctViewDescriptor] {
        &self.distinct_views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_types::RowKind;

    fn handle(calls: Vec<AggregateCall>, count_star: Option<usize>) -> AggsHandle {
        AggsHandle::new(
            &calls,
            &FunctionRegistry::default(),
            count_star,
            count_star.is_some(),
        )
        .unwrap()
    }

    fn row(kind: RowKind, values: Vec<Value>) -> Row {
        Row::new(kind, values)
    }

    #[test]
    fn test_inserted_count_star_is_hidden() {
        let h = handle(
            vec![
                AggregateCall::new(AggregateKind::Sum, vec![1]),
                AggregateCall::new(AggregateKind::CountStar, vec![]),
            ],
            Some(1),
        );
        let mut accs = h.create_accumulators();
        let r = row(RowKind::Insert, vec![Value::from("a"), Value::Int(4)]);
        h.accumulate(&mut accs, &r).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(4)]);
        assert!(!h.record_count_is_zero(&accs));

        h.retract(&mut accs, &r).unwrap();
        assert!(h.record_count_is_zero(&accs));
        assert_eq!(accs, h.create_accumulators());
    }

    #[test]
    fn test_distinct_count_sees_first_and_last_occurrence() {
        let h = handle(
            vec![AggregateCall::new(AggregateKind::Count, vec![0]).distinct()],
            None,
        );
        let mut accs = h.create_accumulators();
        let a = row(RowKind::Insert, vec![Value::from("x")]);
        let b = row(RowKind::Insert, vec![Value::from("y")]);

        h.accumulate(&mut accs, &a).unwrap();
        h.accumulate(&mut accs, &a).unwrap();
        h.accumulate(&mut accs, &b).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(2)]);

        h.retract(&mut accs, &a).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(2)]);
        h.retract(&mut accs, &a).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(1)]);
        assert_eq!(accs.distinct_views[0].len(), 1);

        // retracting a value that was never seen leaves the count alone
        h.retract(&mut accs, &a).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_shared_view_respects_each_filter() {
        // count(distinct v) and count(distinct v) filter (where f)
        let h = handle(
            vec![
                AggregateCall::new(AggregateKind::Count, vec![0]).distinct(),
                AggregateCall::new(AggregateKind::Count, vec![0])
                    .distinct()
                    .with_filter(1),
            ],
            None,
        );
        assert_eq!(h.distinct_views().len(), 1);
        assert!(h.distinct_views()[0].requires_filter_check());

        let mut accs = h.create_accumulators();
        let unfiltered = row(RowKind::Insert, vec![Value::Int(1), Value::Bool(false)]);
        let filtered = row(RowKind::Insert, vec![Value::Int(1), Value::Bool(true)]);

        h.accumulate(&mut accs, &unfiltered).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(1), Value::Int(0)]);

        h.accumulate(&mut accs, &filtered).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(1), Value::Int(1)]);

        h.retract(&mut accs, &filtered).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(1), Value::Int(0)]);
        h.retract(&mut accs, &unfiltered).unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Int(0), Value::Int(0)]);
        assert!(accs.distinct_views[0].is_empty());
    }

    #[test]
    fn test_null_filter_skips_row() {
        let h = handle(
            vec![AggregateCall::new(AggregateKind::Sum, vec![0]).with_filter(1)],
            None,
        );
        let mut accs = h.create_accumulators();
        h.accumulate(&mut accs, &row(RowKind::Insert, vec![Value::Int(3), Value::Null]))
            .unwrap();
        assert_eq!(h.get_value(&accs).unwrap(), vec![Value::Null]);
    }

    #[test]
    fn test_invalid_count_star_index() {
        let calls = vec![AggregateCall::new(AggregateKind::Sum, vec![0])];
        let registry = FunctionRegistry::default();
        assert!(matches!(
            AggsHandle::new(&calls, &registry, Some(0), true),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            AggsHandle::new(&calls, &registry, None, true),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_merge() {
        let h = handle(
            vec![
                AggregateCall::new(AggregateKind::Max, vec![0]),
                AggregateCall::new(AggregateKind::CountStar, vec![]),
            ],
            Some(1),
        );
        let mut a = h.create_accumulators();
        let mut b = h.create_accumulators();
        h.accumulate(&mut a, &row(RowKind::Insert, vec![Value::Int(3)]))
            .unwrap();
        h.accumulate(&mut b, &row(RowKind::Insert, vec![Value::Int(9)]))
            .unwrap();
        h.merge(&mut a, &b).unwrap();
        assert_eq!(h.get_value(&a).unwrap(), vec![Value::Int(9)]);
        assert_eq!(a.accumulators[1], Accumulator::Count(2));
    }
}
