use super::{Accumulator, AggregateFunction, Lifecycle};
use crate::{Error, Result};
use eddy_types::Value;

fn first_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value> {
    args.first()
        .ok_or_else(|| Error::config(format!("{} requires one input field", name)))
}

fn arithmetic_error(name: &str, a: &Value, b: &Value) -> Error {
    Error::invalid_input(format!("{}: cannot combine {:?} with {:?}", name, a, b))
}

/// Counts rows, including nulls.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountStar;

impl Lifecycle for CountStar {}

impl AggregateFunction for CountStar {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::Count(0)
    }

    fn accumulate(&self, acc: &mut Accumulator, _args: &[Value]) -> Result<()> {
        match acc {
            Accumulator::Count(c) => *c += 1,
            _ => return Err(acc.shape_error("count")),
        }
        Ok(())
    }

    fn retract(&self, acc: &mut Accumulator, _args: &[Value]) -> Result<()> {
        match acc {
            Accumulator::Count(c) => *c -= 1,
            _ => return Err(acc.shape_error("count")),
        }
        Ok(())
    }

    fn merge(&self, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
        match (acc, other) {
            (Accumulator::Count(a), Accumulator::Count(b)) => *a += b,
            (acc, _) => return Err(acc.shape_error("count")),
        }
        Ok(())
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value> {
        match acc {
            Accumulator::Count(c) => Ok(Value::Int(*c)),
            _ => Err(acc.shape_error("count")),
        }
    }
}

/// Counts non-null values of its argument.
#[derive(Debug, Default, Clone, Copy)]
pub struct Count;

impl Lifecycle for Count {}

impl AggregateFunction for Count {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::Count(0)
    }

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        if first_arg("count", args)?.is_null() {
            return Ok(());
        }
        CountStar.accumulate(acc, args)
    }

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        if first_arg("count", args)?.is_null() {
            return Ok(());
        }
        CountStar.retract(acc, args)
    }

    fn merge(&self, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
        CountStar.merge(acc, other)
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value> {
        CountStar.get_value(acc)
    }
}

fn sum_accumulate(name: &str, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
    let v = first_arg(name, args)?;
    if v.is_null() {
        return Ok(());
    }
    match acc {
        Accumulator::Sum { sum, count } => {
            *sum = if sum.is_null() {
                if v.as_f64().is_none() {
                    return Err(arithmetic_error(name, sum, v));
                }
                v.clone()
            } else {
                sum.checked_add(v)
                    .ok_or_else(|| arithmetic_error(name, sum, v))?
            };
            *count += 1;
        }
        _ => return Err(acc.shape_error("sum")),
    }
    Ok(())
}

fn sum_retract(name: &str, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
    let v = first_arg(name, args)?;
    if v.is_null() {
        return Ok(());
    }
    match acc {
        Accumulator::Sum { sum, count } => {
            let next = if sum.is_null() {
                Value::Int(0).checked_sub(v)
            } else {
                sum.checked_sub(v)
            }
            .ok_or_else(|| arithmetic_error(name, sum, v))?;
            *count -= 1;
            *sum = if *count == 0 { Value::Null } else { next };
        }
        _ => return Err(acc.shape_error("sum")),
    }
    Ok(())
}

fn sum_merge(name: &str, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
    match (acc, other) {
        (
            Accumulator::Sum { sum, count },
            Accumulator::Sum {
                sum: other_sum,
                count: other_count,
            },
        ) => {
            if !other_sum.is_null() {
                *sum = if sum.is_null() {
                    other_sum.clone()
                } else {
                    sum.checked_add(other_sum)
                        .ok_or_else(|| arithmetic_error(name, sum, other_sum))?
                };
            }
            *count += other_count;
            if *count == 0 {
                *sum = Value::Null;
            }
        }
        (acc, _) => return Err(acc.shape_error("sum")),
    }
    Ok(())
}

/// Sum of non-null values; NULL when nothing contributes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sum;

impl Lifecycle for Sum {}

impl AggregateFunction for Sum {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::Sum {
            sum: Value::Null,
            count: 0,
        }
    }

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        sum_accumulate("sum", acc, args)
    }

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        sum_retract("sum", acc, args)
    }

    fn merge(&self, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
        sum_merge("sum", acc, other)
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value> {
        match acc {
            Accumulator::Sum { sum, count } if *count != 0 => Ok(sum.clone()),
            Accumulator::Sum { .. } => Ok(Value::Null),
            _ => Err(acc.shape_error("sum")),
        }
    }
}

/// Like [`Sum`], but yields 0 instead of NULL for an empty group.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sum0;

impl Lifecycle for Sum0 {}

impl AggregateFunction for Sum0 {
    fn create_accumulator(&self) -> Accumulator {
        Sum.create_accumulator()
    }

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        sum_accumulate("sum0", acc, args)
    }

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        sum_retract("sum0", acc, args)
    }

    fn merge(&self, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
        sum_merge("sum0", acc, other)
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value> {
        match Sum.get_value(acc)? {
            Value::Null => Ok(Value::Int(0)),
            v => Ok(v),
        }
    }
}

/// Average of non-null values. Integer input averages with integer division.
#[derive(Debug, Default, Clone, Copy)]
pub struct Avg;

impl Lifecycle for Avg {}

impl AggregateFunction for Avg {
    fn create_accumulator(&self) -> Accumulator {
        Sum.create_accumulator()
    }

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        sum_accumulate("avg", acc, args)
    }

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        sum_retract("avg", acc, args)
    }

    fn merge(&self, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
        sum_merge("avg", acc, other)
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value> {
        match acc {
            Accumulator::Sum { count: 0, .. } => Ok(Value::Null),
            Accumulator::Sum {
                sum: Value::Int(s),
                count,
            } => Ok(Value::Int(s.wrapping_div(*count))),
            Accumulator::Sum { sum, count } => match sum.as_f64() {
                Some(s) => Ok(Value::from(s / *count as f64)),
                None => Err(arithmetic_error("avg", sum, &Value::Int(*count))),
            },
            _ => Err(acc.shape_error("sum")),
        }
    }
}

fn values_accumulate(name: &str, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
    let v = first_arg(name, args)?;
    if v.is_null() {
        return Ok(());
    }
    match acc {
        Accumulator::Values(values) => Accumulator::add_value(values, v.clone()),
        _ => return Err(acc.shape_error("values")),
    }
    Ok(())
}

fn values_retract(name: &str, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
    let v = first_arg(name, args)?;
    if v.is_null() {
        return Ok(());
    }
    match acc {
        Accumulator::Values(values) => Accumulator::remove_value(values, v),
        _ => return Err(acc.shape_error("values")),
    }
    Ok(())
}

fn values_merge(acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
    match (acc, other) {
        (Accumulator::Values(values), Accumulator::Values(other)) => {
            for (v, count) in other {
                *values.entry(v.clone()).or_default() += count;
            }
        }
        (acc, _) => return Err(acc.shape_error("values")),
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Min;

impl Lifecycle for Min {}

impl AggregateFunction for Min {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::Values(Default::default())
    }

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        values_accumulate("min", acc, args)
    }

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        values_retract("min", acc, args)
    }

    fn merge(&self, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
        values_merge(acc, other)
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value> {
        match acc {
            Accumulator::Values(values) => Ok(values
                .keys()
                .next()
                .cloned()
                .unwrap_or(Value::Null)),
            _ => Err(acc.shape_error("values")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Max;

impl Lifecycle for Max {}

impl AggregateFunction for Max {
    fn create_accumulator(&self) -> Accumulator {
        Accumulator::Values(Default::default())
    }

    fn accumulate(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        values_accumulate("max", acc, args)
    }

    fn retract(&self, acc: &mut Accumulator, args: &[Value]) -> Result<()> {
        values_retract("max", acc, args)
    }

    fn merge(&self, acc: &mut Accumulator, other: &Accumulator) -> Result<()> {
        values_merge(acc, other)
    }

    fn get_value(&self, acc: &Accumulator) -> Result<Value> {
        match acc {
            Accumulator::Values(values) => Ok(values
                .keys()
                .next_back()
                .cloned()
                .unwrap_or(Value::Null)),
            _ => Err(acc.shape_error("values")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn run(f: &dyn AggregateFunction, inputs: &[Value]) -> Accumulator {
        let mut acc = f.create_accumulator();
        for v in inputs {
            f.accumulate(&mut acc, &[v.clone()]).unwrap();
        }
        acc
    }

    #[test_case(&Sum, Value::Int(8); "sum")]
    #[test_case(&Sum0, Value::Int(8); "sum0")]
    #[test_case(&Count, Value::Int(2); "count")]
    #[test_case(&CountStar, Value::Int(3); "count_star")]
    #[test_case(&Min, Value::Int(3); "min")]
    #[test_case(&Max, Value::Int(5); "max")]
    #[test_case(&Avg, Value::Int(4); "avg")]
    fn test_builtin_values(f: &dyn AggregateFunction, expected: Value) {
        let acc = run(f, &[Value::Int(5), Value::Null, Value::Int(3)]);
        assert_eq!(f.get_value(&acc).unwrap(), expected);
    }

    #[test_case(&Sum, Value::Null; "sum")]
    #[test_case(&Sum0, Value::Int(0); "sum0")]
    #[test_case(&Min, Value::Null; "min")]
    #[test_case(&Avg, Value::Null; "avg")]
    fn test_empty_group(f: &dyn AggregateFunction, expected: Value) {
        let acc = f.create_accumulator();
        assert_eq!(f.get_value(&acc).unwrap(), expected);
    }

    #[test_case(&Sum; "sum")]
    #[test_case(&Count; "count")]
    #[test_case(&Min; "min")]
    #[test_case(&Max; "max")]
    #[test_case(&Avg; "avg")]
    fn test_retract_inverts_accumulate(f: &dyn AggregateFunction) {
        for existing in [vec![], vec![Value::Int(4)], vec![Value::Int(4), Value::Int(9)]] {
            for x in [Value::Int(-2), Value::Int(4), Value::Int(100), Value::Null] {
                let before = run(f, &existing);
                let mut acc = before.clone();
                f.accumulate(&mut acc, &[x.clone()]).unwrap();
                f.retract(&mut acc, &[x.clone()]).unwrap();
                assert_eq!(acc, before, "{:?} then retract {:?}", existing, x);
            }
        }
    }

    #[test]
    fn test_min_restores_after_retraction() {
        let mut acc = run(&Min, &[Value::Int(3), Value::Int(1), Value::Int(1)]);
        Min.retract(&mut acc, &[Value::Int(1)]).unwrap();
        assert_eq!(Min.get_value(&acc).unwrap(), Value::Int(1));
        Min.retract(&mut acc, &[Value::Int(1)]).unwrap();
        assert_eq!(Min.get_value(&acc).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_float_avg_and_merge() {
        let mut a = run(&Avg, &[Value::from(1.0), Value::from(2.0)]);
        let b = run(&Avg, &[Value::from(6.0)]);
        Avg.merge(&mut a, &b).unwrap();
        assert_eq!(Avg.get_value(&a).unwrap(), Value::from(3.0));
    }

    #[test]
    fn test_sum_of_strings_is_rejected() {
        let mut acc = Sum.create_accumulator();
        assert!(matches!(
            Sum.accumulate(&mut acc, &[Value::from("x")]),
            Err(Error::InvalidInput(_))
        ));
    }
}
