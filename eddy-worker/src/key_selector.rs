use crate::{Error, Result};
use eddy_types::{Row, Value};

/// The grouping key: the values of the grouping fields, in declaration order.
pub type GroupKey = Vec<Value>;

pub(crate) fn field(row: &Row, idx: usize) -> Result<&Value> {
    row.get(idx).ok_or_else(|| {
        Error::config(format!(
            "field {} is out of range for a row of arity {}",
            idx,
            row.arity()
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySelector {
    grouping: Vec<usize>,
}

impl KeySelector {
    pub fn new(grouping: Vec<usize>) -> Self {
        KeySelector { grouping }
    }

    pub fn get_key(&self, row: &Row) -> Result<GroupKey> {
        self.grouping
            .iter()
            .map(|idx| field(row, *idx).cloned())
            .collect()
    }
}
