/*!
# Dependency Partitioner

Splits a [`DataView`] recursively by a list of [`DependencyEntry`]s. Each entry names a
parameter and the columns it varies across; every unique combination of those columns in the
*current* slice opens one branch, so partitioning is strictly nested and sibling branches never
share rows.

Each leaf [`Partition`] records the key every binding entry took on the way down. The compiler
uses those keys to find, for every parameter, the node of the matching tag.

# Examples

```rust
use mini_hbm::data::DataTable;
use mini_hbm::partition::{partition, DependencyEntry};

let data = DataTable::new()
    .with_column("cond", vec!["a", "a", "b", "b"])
    .unwrap()
    .with_column("stim", vec![1_i64, 2, 1, 2])
    .unwrap();

let entries = [
    DependencyEntry::new("v", &["cond"]),
    DependencyEntry::new("t", &["stim"]),
];
let parts = partition(&data.view(), &entries).unwrap();
assert_eq!(parts.len(), 4);
assert_eq!(parts[0].tag(), "(a, 1)");
assert_eq!(parts[0].bindings["v"].to_string(), "a");
```
*/

use indexmap::IndexMap;

use crate::data::{DataView, Key};
use crate::errors::DataError;

/// One level of partitioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEntry {
    pub param: String,
    pub columns: Vec<String>,
    /// Whether the key of this level is recorded as a binding for `param`.
    pub binds: bool,
}

impl DependencyEntry {
    pub fn new(param: impl Into<String>, columns: &[impl AsRef<str>]) -> Self {
        Self {
            param: param.into(),
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            binds: true,
        }
    }

    /// An entry that splits the data without binding its parameter.
    pub fn split_only(mut self) -> Self {
        self.binds = false;
        self
    }
}

/// A leaf of the partitioning.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition<'a> {
    pub data: DataView<'a>,
    /// Key taken by each binding entry's parameter.
    pub bindings: IndexMap<String, Key>,
    /// Keys of every level, outermost first.
    pub path: Vec<Key>,
}

impl Partition<'_> {
    /// The tag of this partition: empty without any level, the key itself for a single level,
    /// and the tuple of all level values otherwise.
    pub fn tag(&self) -> String {
        path_tag(&self.path)
    }
}

pub(crate) fn path_tag(path: &[Key]) -> String {
    match path {
        [] => String::new(),
        [single] => single.to_string(),
        levels => Key(levels.iter().flat_map(|k| k.values().iter().cloned()).collect()).to_string(),
    }
}

/// Partitions `view` by `entries`, in order.
///
/// Fails if a column named by an entry is missing from the table.
pub fn partition<'a>(
    view: &DataView<'a>,
    entries: &[DependencyEntry],
) -> Result<Vec<Partition<'a>>, DataError> {
    let mut out = Vec::new();
    let mut path = Vec::with_capacity(entries.len());
    let mut bindings = IndexMap::new();
    split(view, entries, &mut path, &mut bindings, &mut out)?;
    Ok(out)
}

fn split<'a>(
    view: &DataView<'a>,
    entries: &[DependencyEntry],
    path: &mut Vec<Key>,
    bindings: &mut IndexMap<String, Key>,
    out: &mut Vec<Partition<'a>>,
) -> Result<(), DataError> {
    let Some((entry, rest)) = entries.split_first() else {
        out.push(Partition {
            data: view.clone(),
            bindings: bindings.clone(),
            path: path.clone(),
        });
        return Ok(());
    };

    for key in view.unique(&entry.columns)? {
        let slice = view.select(&entry.columns, &key)?;
        if entry.binds {
            bindings.insert(entry.param.clone(), key.clone());
        }
        path.push(key);
        split(&slice, rest, path, bindings, out)?;
        path.pop();
    }
    if entry.binds {
        bindings.shift_remove(&entry.param);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataTable;

    fn table() -> DataTable {
        DataTable::new()
            .with_column("subj_idx", vec![0_i64, 0, 0, 0, 1, 1, 1])
            .unwrap()
            .with_column("cond", vec!["a", "b", "a", "b", "a", "a", "a"])
            .unwrap()
            .with_column("stim", vec![1_i64, 1, 2, 2, 1, 2, 2])
            .unwrap()
    }

    #[test]
    fn no_entries_yield_one_untagged_partition() {
        let data = table();
        let parts = partition(&data.view(), &[]).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].tag(), "");
        assert_eq!(parts[0].data.len(), 7);
        assert!(parts[0].bindings.is_empty());
    }

    #[test]
    fn partitions_cover_rows_exactly_once() {
        let data = table();
        let entries = [
            DependencyEntry::new("v", &["cond"]),
            DependencyEntry::new("a", &["stim"]),
        ];
        let parts = partition(&data.view(), &entries).unwrap();
        assert_eq!(parts.len(), 4);

        let mut rows: Vec<usize> = parts.iter().flat_map(|p| p.data.rows().to_vec()).collect();
        rows.sort_unstable();
        assert_eq!(rows, (0..7).collect::<Vec<_>>());

        let tags: Vec<String> = parts.iter().map(Partition::tag).collect();
        assert_eq!(tags, vec!["(a, 1)", "(a, 2)", "(b, 1)", "(b, 2)"]);
    }

    #[test]
    fn unique_values_come_from_the_current_slice() {
        let data = table();
        let entries = [
            DependencyEntry::new("s", &["subj_idx"]),
            DependencyEntry::new("v", &["cond"]),
        ];
        let parts = partition(&data.view(), &entries).unwrap();
        // subject 1 only saw condition `a`
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].tag(), "(1, a)");
    }

    #[test]
    fn split_only_entries_do_not_bind() {
        let data = table();
        let entries = [
            DependencyEntry::new("v", &["cond"]),
            DependencyEntry::new("wfpt", &["stim"]).split_only(),
        ];
        let parts = partition(&data.view(), &entries).unwrap();
        assert!(parts.iter().all(|p| p.bindings.len() == 1));
        assert!(parts.iter().all(|p| p.path.len() == 2));
    }

    #[test]
    fn multi_column_entries_form_one_level() {
        let data = table();
        let entries = [DependencyEntry::new("v", &["cond", "stim"])];
        let parts = partition(&data.view(), &entries).unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].tag(), "(a, 1)");
        assert_eq!(parts[0].path.len(), 1);
    }

    #[test]
    fn missing_columns_fail() {
        let data = table();
        let entries = [DependencyEntry::new("v", &["nope"])];
        assert_eq!(
            partition(&data.view(), &entries),
            Err(DataError::MissingColumn("nope".to_string()))
        );
    }
}
