//! Relational join of two tables on a single key column.

use crate::error::{DatasetError, DatasetResult};
use crate::table::{Column, DataType, Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Which unmatched rows a join keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    /// Only rows whose key appears on both sides
    Inner,
    /// Every left row, matched right rows or nulls
    Left,
    /// Every right row, matched left rows or nulls
    Right,
    /// Every row from both sides
    Outer,
}

impl JoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Outer => "outer",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinType {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "outer" => Ok(JoinType::Outer),
            other => Err(DatasetError::InvalidRequest(format!(
                "invalid join type '{other}', expected one of inner, left, right, outer"
            ))),
        }
    }
}

/// Hashable form of a key cell. Integral floats hash as integers so that
/// `2` and `2.0` match.
#[derive(Debug, PartialEq, Eq, Hash)]
enum JoinKey<'a> {
    Int(i64),
    Float(u64),
    Bool(bool),
    Text(&'a str),
}

fn join_key(value: &Value) -> Option<JoinKey<'_>> {
    match value {
        Value::Null => None,
        Value::Int(i) => Some(JoinKey::Int(*i)),
        Value::Float(f) if f.is_nan() => None,
        Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Some(JoinKey::Int(*f as i64))
        }
        Value::Float(f) => Some(JoinKey::Float(f.to_bits())),
        Value::Bool(b) => Some(JoinKey::Bool(*b)),
        Value::Text(s) => Some(JoinKey::Text(s)),
    }
}

fn is_numeric(dtype: DataType) -> bool {
    matches!(dtype, DataType::Int | DataType::Float)
}

fn check_compatible(on: &str, left: &Column, right: &Column) -> DatasetResult<()> {
    // An all-null key column matches nothing but is not a type error
    if !left.has_values() || !right.has_values() {
        return Ok(());
    }

    let (l, r) = (left.dtype(), right.dtype());
    if l == r || (is_numeric(l) && is_numeric(r)) {
        Ok(())
    } else {
        Err(DatasetError::IncompatibleJoin {
            column: on.to_string(),
            left: l.to_string(),
            right: r.to_string(),
        })
    }
}

fn key_column<'t>(table: &'t Table, on: &str, side: &'static str) -> DatasetResult<&'t Column> {
    table.column(on).ok_or_else(|| DatasetError::JoinColumnMissing {
        column: on.to_string(),
        side,
        available: table.column_names().join(", "),
    })
}

fn build_index(column: &Column) -> HashMap<JoinKey<'_>, Vec<usize>> {
    let mut index: HashMap<JoinKey<'_>, Vec<usize>> = HashMap::new();
    for (row, value) in column.values().iter().enumerate() {
        if let Some(key) = join_key(value) {
            index.entry(key).or_default().push(row);
        }
    }
    index
}

/// Row pairings `(left row, right row)` in output order
fn pair_rows(left_key: &Column, right_key: &Column, how: JoinType) -> Vec<(Option<usize>, Option<usize>)> {
    let mut pairs = Vec::new();

    if how == JoinType::Right {
        let index = build_index(left_key);
        for (r, value) in right_key.values().iter().enumerate() {
            match join_key(value).and_then(|k| index.get(&k)) {
                Some(matches) => pairs.extend(matches.iter().map(|&l| (Some(l), Some(r)))),
                None => pairs.push((None, Some(r))),
            }
        }
        return pairs;
    }

    let index = build_index(right_key);
    let mut right_matched = vec![false; right_key.len()];

    for (l, value) in left_key.values().iter().enumerate() {
        match join_key(value).and_then(|k| index.get(&k)) {
            Some(matches) => {
                for &r in matches {
                    right_matched[r] = true;
                    pairs.push((Some(l), Some(r)));
                }
            }
            None if how != JoinType::Inner => pairs.push((Some(l), None)),
            None => {}
        }
    }

    if how == JoinType::Outer {
        pairs.extend(
            right_matched
                .iter()
                .enumerate()
                .filter(|(_, matched)| !**matched)
                .map(|(r, _)| (None, Some(r))),
        );
    }

    pairs
}

fn gather(column: &Column, rows: impl Iterator<Item = Option<usize>>) -> Vec<Value> {
    rows.map(|row| row.map_or(Value::Null, |i| column.values()[i].clone()))
        .collect()
}

/// Output names for one side's non-key columns; names shared with `other`
/// get `suffix`
fn output_names(columns: &[&Column], other: &Table, suffix: &str) -> Vec<String> {
    columns
        .iter()
        .map(|c| {
            if other.column(c.name()).is_some() {
                format!("{}{suffix}", c.name())
            } else {
                c.name().to_string()
            }
        })
        .collect()
}

/// Suffixing can collide with an existing name, e.g. `name` and `name_x` on
/// the left with `name` on the right
fn check_unique_names(on: &str, left: &[String], right: &[String]) -> DatasetResult<()> {
    let mut seen = HashSet::new();
    seen.insert(on);
    match left.iter().chain(right).find(|name| !seen.insert(name.as_str())) {
        Some(name) => Err(DatasetError::InvalidRequest(format!(
            "joining on '{on}' would produce column '{name}' twice; rename it in one of the files"
        ))),
        None => Ok(()),
    }
}

/// Join `left` and `right` on column `on`.
///
/// The key column comes first, followed by the remaining left columns and
/// then the remaining right columns. Non-key columns present on both sides
/// are suffixed `_x` (left) and `_y` (right). Null keys never match, and a
/// matched row takes its key cell from the left side.
pub fn join(left: &Table, right: &Table, on: &str, how: JoinType) -> DatasetResult<Table> {
    let left_key = key_column(left, on, "left")?;
    let right_key = key_column(right, on, "right")?;
    check_compatible(on, left_key, right_key)?;

    let pairs = pair_rows(left_key, right_key, how);

    let left_rest: Vec<&Column> = left.columns().iter().filter(|c| c.name() != on).collect();
    let right_rest: Vec<&Column> = right.columns().iter().filter(|c| c.name() != on).collect();
    let left_names = output_names(&left_rest, right, "_x");
    let right_names = output_names(&right_rest, left, "_y");
    check_unique_names(on, &left_names, &right_names)?;

    let mut columns = Vec::with_capacity(1 + left_rest.len() + right_rest.len());

    let keys = pairs
        .iter()
        .map(|&(l, r)| match (l, r) {
            (Some(l), _) => left_key.values()[l].clone(),
            (None, Some(r)) => right_key.values()[r].clone(),
            (None, None) => Value::Null,
        })
        .collect();
    columns.push(Column::new(on, keys));

    for (column, name) in left_rest.iter().zip(left_names) {
        columns.push(Column::new(name, gather(column, pairs.iter().map(|p| p.0))));
    }
    for (column, name) in right_rest.iter().zip(right_names) {
        columns.push(Column::new(name, gather(column, pairs.iter().map(|p| p.1))));
    }

    Table::new(columns)
}
