use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Tables whose row changes are republished to stream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Students,
    Courses,
    Enrollments,
    Attendance,
    Grades,
    Faculty,
    Departments,
    Announcements,
}

impl TableName {
    pub const ALL: [TableName; 8] = [
        TableName::Students,
        TableName::Courses,
        TableName::Enrollments,
        TableName::Attendance,
        TableName::Grades,
        TableName::Faculty,
        TableName::Departments,
        TableName::Announcements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Students => "students",
            TableName::Courses => "courses",
            TableName::Enrollments => "enrollments",
            TableName::Attendance => "attendance",
            TableName::Grades => "grades",
            TableName::Faculty => "faculty",
            TableName::Departments => "departments",
            TableName::Announcements => "announcements",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown table: {0}")]
pub struct UnknownTable(pub String);

impl FromStr for TableName {
    type Err = UnknownTable;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        TableName::ALL
            .into_iter()
            .find(|table| table.as_str() == normalized)
            .ok_or_else(|| UnknownTable(value.trim().to_string()))
    }
}

/// A small fixed-size set of [`TableName`]s.
///
/// Backed by a bitmask so membership checks on the publish path are a
/// single AND.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TableSet(u16);

impl TableSet {
    pub const fn empty() -> Self {
        TableSet(0)
    }

    pub fn all() -> Self {
        TableName::ALL.into_iter().collect()
    }

    pub fn contains(&self, table: TableName) -> bool {
        self.0 & table.bit() != 0
    }

    pub fn insert(&mut self, table: TableName) {
        self.0 |= table.bit();
    }

    pub fn remove(&mut self, table: TableName) {
        self.0 &= !table.bit();
    }

    pub fn intersection(&self, other: TableSet) -> TableSet {
        TableSet(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates members in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = TableName> + '_ {
        TableName::ALL
            .into_iter()
            .filter(move |table| self.contains(*table))
    }
}

impl FromIterator<TableName> for TableSet {
    fn from_iter<I: IntoIterator<Item = TableName>>(iter: I) -> Self {
        let mut set = TableSet::empty();
        for table in iter {
            set.insert(table);
        }
        set
    }
}

/// Parses a comma-separated list. `*` selects every table.
impl FromStr for TableSet {
    type Err = UnknownTable;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut set = TableSet::empty();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "*" {
                return Ok(TableSet::all());
            }
            set.insert(part.parse()?);
        }
        Ok(set)
    }
}

impl fmt::Debug for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|t| t.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

impl Serialize for TableSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}
