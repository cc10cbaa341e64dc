use super::{Accumulator, Lifecycle};
use crate::{Error, Result};
use eddy_types::Value;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// An aggregate that produces zero or more rows per group rather than a single value.
pub trait TableAggregateFunction: Lifecycle + Debug + Send {
    fn create_accumulator(&self) -> Accumulator;

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()>;

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()>;

    /// The rows currently represented by `acc`, without the grouping key.
    fn emit_value(&self, acc: &Accumulator) -> Result<Vec<Vec<Value>>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableAggregateKind {
    TopN { n: usize },
    Udf(String),
}

/// Emits the `n` largest non-null values with their 1-based rank.
#[derive(Debug, Clone, Copy)]
pub struct TopN {
    n: usize,
}

impl TopN {
    pub fn new(n: usize) -> Self {
        TopN { n }
    }
}

impl Lifecycle for TopN {}

impl TableAggregateFunction for TopN {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::Values(Default::default())
    }

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        let v = args
            .first()
            .ok_or_else(|| Error::config("top_n requires one input field"))?;
        match acc {
            Accumulator::Values(values) if !v.is_null() => {
                Accumulator::add_value(values, v.clone())
            }
            Accumulator::Values(_) => {}
            _ => return Err(acc.shape_error("values")),
        }
        Ok(())
    }

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        let v = args
            .first()
            .ok_or_else(|| Error::config("top_n requires one input field"))?;
        match acc {
            Accumulator::Values(values) => Accumulator::remove_value(values, v),
            _ => return Err(acc.shape_error("values")),
        }
        Ok(())
    }

    fn emit_value(&self, acc: &Accumulator) -> Result<Vec<Vec<Value>>> {
        let Accumulator::Values(values) = acc else {
            return Err(acc.shape_error("values"));
        };

        Ok(values
            .iter()
            .rev()
            .flat_map(|(v, count)| std::iter::repeat(v).take(*count as usize))
            .take(self.n)
            .enumerate()
            .map(|(i, v)| vec![v.clone(), Value::Int(i as i64 + 1)])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_n_ranks_duplicates() {
        let top = TopN::new(2);
        let mut acc = top.create_accumulator();
        for v in [1, 7, 7, 3] {
            top.accumulate(&mut acc, &[Value::Int(v)]).unwrap();
        }
        assert_eq!(
            top.emit_value(&acc).unwrap(),
            vec![
                vec![Value::Int(7), Value::Int(1)],
                vec![Value::Int(7), Value::Int(2)]
            ]
        );

        top.retract(&mut acc, &[Value::Int(7)]).unwrap();
        assert_eq!(
            top.emit_value(&acc).unwrap(),
            vec![
                vec![Value::Int(7), Value::Int(1)],
                vec![Value::Int(3), Value::Int(2)]
            ]
        );
    }
}
