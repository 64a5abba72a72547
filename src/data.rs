/*!
# Column-Oriented Observation Tables

A [`DataTable`] holds named columns of integers, floats or strings, one row per observation
(trial). Models never copy rows around while partitioning; instead they work on [`DataView`]s,
which are a borrowed table plus an ordered list of row indices.

Unique values of one or more columns are represented by a [`Key`], whose `Display` form is the
*tag* under which nodes for that partition are stored.

# Examples

```rust
use mini_hbm::data::DataTable;

let data = DataTable::new()
    .with_column("subj_idx", vec![0_i64, 0, 1, 1])
    .unwrap()
    .with_column("cond", vec!["easy", "hard", "easy", "hard"])
    .unwrap()
    .with_column("rt", vec![0.51, 0.72, 0.48, 0.80])
    .unwrap();

let view = data.view();
let conds = view.unique(&["cond"]).unwrap();
assert_eq!(conds.len(), 2);
assert_eq!(conds[0].to_string(), "easy");

let hard = view.select(&["cond"], &conds[1]).unwrap();
assert_eq!(hard.rows(), &[1, 3]);
```
*/

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use ndarray::Array1;

use crate::errors::DataError;

/// A single typed column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int(Array1<i64>),
    Float(Array1<f64>),
    Text(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value at `row`. Panics if `row` is out of bounds.
    pub fn get(&self, row: usize) -> Value {
        match self {
            Column::Int(v) => Value::Int(v[row]),
            Column::Float(v) => Value::Float(v[row]),
            Column::Text(v) => Value::Text(v[row].clone()),
        }
    }

    fn take(&self, rows: &[usize]) -> Column {
        match self {
            Column::Int(v) => Column::Int(rows.iter().map(|&r| v[r]).collect()),
            Column::Float(v) => Column::Float(rows.iter().map(|&r| v[r]).collect()),
            Column::Text(v) => Column::Text(rows.iter().map(|&r| v[r].clone()).collect()),
        }
    }
}

impl From<Vec<i64>> for Column {
    fn from(v: Vec<i64>) -> Self {
        Column::Int(Array1::from(v))
    }
}

impl From<Vec<f64>> for Column {
    fn from(v: Vec<f64>) -> Self {
        Column::Float(Array1::from(v))
    }
}

impl From<Array1<i64>> for Column {
    fn from(v: Array1<i64>) -> Self {
        Column::Int(v)
    }
}

impl From<Array1<f64>> for Column {
    fn from(v: Array1<f64>) -> Self {
        Column::Float(v)
    }
}

impl From<Vec<String>> for Column {
    fn from(v: Vec<String>) -> Self {
        Column::Text(v)
    }
}

impl From<Vec<&str>> for Column {
    fn from(v: Vec<&str>) -> Self {
        Column::Text(v.into_iter().map(str::to_string).collect())
    }
}

/// A scalar cell value with a total order (floats compare via `total_cmp`).
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Float(_) => 1,
            Value::Text(_) => 2,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// The combination of values a row takes in one or more columns.
///
/// Displays as the bare value for single-column keys and as `(v1, v2, ...)` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key(pub Vec<Value>);

impl Key {
    pub fn single(value: impl Into<Value>) -> Self {
        Key(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// A column-oriented table of observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    columns: IndexMap<String, Column>,
    n_rows: usize,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column, checking that its length agrees with the columns already present.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: impl Into<Column>,
    ) -> Result<Self, DataError> {
        let name = name.into();
        let column = column.into();
        if !self.columns.is_empty() && column.len() != self.n_rows {
            return Err(DataError::LengthMismatch {
                column: name,
                expected: self.n_rows,
                found: column.len(),
            });
        }
        self.n_rows = column.len();
        self.columns.insert(name, column);
        Ok(self)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn column(&self, name: &str) -> Result<&Column, DataError> {
        self.columns
            .get(name)
            .ok_or_else(|| DataError::MissingColumn(name.to_string()))
    }

    /// A view over every row of the table.
    pub fn view(&self) -> DataView<'_> {
        DataView {
            table: self,
            rows: (0..self.n_rows).collect(),
        }
    }

    /// Copies the given rows, in order, into a new table.
    pub fn take(&self, rows: &[usize]) -> DataTable {
        DataTable {
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.take(rows)))
                .collect(),
            n_rows: rows.len(),
        }
    }
}

/// A borrowed subset of a table's rows, in ascending row order.
#[derive(Debug, Clone, PartialEq)]
pub struct DataView<'a> {
    table: &'a DataTable,
    rows: Vec<usize>,
}

impl<'a> DataView<'a> {
    pub fn table(&self) -> &'a DataTable {
        self.table
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The key that `row` takes in `columns`.
    pub fn key(&self, row: usize, columns: &[impl AsRef<str>]) -> Result<Key, DataError> {
        columns
            .iter()
            .map(|c| -> Result<Value, DataError> { Ok(self.table.column(c.as_ref())?.get(row)) })
            .collect::<Result<Vec<_>, _>>()
            .map(Key)
    }

    /// Sorted unique keys of `columns` among the rows of this view.
    pub fn unique(&self, columns: &[impl AsRef<str>]) -> Result<Vec<Key>, DataError> {
        let mut seen = BTreeSet::new();
        for &row in &self.rows {
            seen.insert(self.key(row, columns)?);
        }
        Ok(seen.into_iter().collect())
    }

    /// Restricts the view to rows whose `columns` take the value `key`.
    pub fn select(&self, columns: &[impl AsRef<str>], key: &Key) -> Result<DataView<'a>, DataError> {
        let cols = columns
            .iter()
            .map(|c| self.table.column(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self
            .rows
            .iter()
            .copied()
            .filter(|&row| {
                cols.iter()
                    .zip(key.values())
                    .all(|(col, value)| col.get(row) == *value)
            })
            .collect();
        Ok(DataView {
            table: self.table,
            rows,
        })
    }

    /// The numeric values of `column` for the rows of this view.
    pub fn column_f64(&self, column: &str) -> Result<Array1<f64>, DataError> {
        match self.table.column(column)? {
            Column::Int(v) => Ok(self.rows.iter().map(|&r| v[r] as f64).collect()),
            Column::Float(v) => Ok(self.rows.iter().map(|&r| v[r]).collect()),
            Column::Text(_) => Err(DataError::NotNumeric(column.to_string())),
        }
    }

    /// Copies the rows of this view into an owned table.
    pub fn to_table(&self) -> DataTable {
        self.table.take(&self.rows)
    }
}
