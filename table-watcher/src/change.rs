use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::table::TableName;

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "inserted",
            ChangeOperation::Update => "updated",
            ChangeOperation::Delete => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeError {
    #[error("change carries neither a new nor an old record")]
    MissingRecords,
    #[error("{0} change is missing its new record")]
    MissingNewRecord(&'static str),
    #[error("DELETE change is missing its old record")]
    MissingOldRecord,
    #[error("notification for table {found} arrived on the {expected} feed")]
    TableMismatch { expected: TableName, found: String },
    #[error("malformed notification payload: {0}")]
    Malformed(String),
}

/// A normalized row change. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    table: TableName,
    operation: ChangeOperation,
    new_record: Option<Record>,
    old_record: Option<Record>,
    occurred_at: DateTime<Utc>,
    /// Row images were cut down to their `id` to fit the notify limit.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    truncated: bool,
}

impl ChangeEvent {
    pub fn new(
        table: TableName,
        operation: ChangeOperation,
        new_record: Option<Record>,
        old_record: Option<Record>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, ChangeError> {
        match (operation, new_record.is_some(), old_record.is_some()) {
            (_, false, false) => return Err(ChangeError::MissingRecords),
            (ChangeOperation::Insert, false, _) | (ChangeOperation::Update, false, _) => {
                return Err(ChangeError::MissingNewRecord(operation.as_str()))
            }
            (ChangeOperation::Delete, _, false) => return Err(ChangeError::MissingOldRecord),
            _ => {}
        }
        Ok(Self {
            table,
            operation,
            new_record,
            old_record,
            occurred_at,
            truncated: false,
        })
    }

    /// Builds an event from a native notification received on `table`'s feed.
    ///
    /// Notifications without a commit timestamp are stamped with `received_at`.
    pub fn from_raw(
        table: TableName,
        raw: RawChange,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ChangeError> {
        if let Some(name) = raw.table.as_deref() {
            if !name.eq_ignore_ascii_case(table.as_str()) {
                return Err(ChangeError::TableMismatch {
                    expected: table,
                    found: name.to_string(),
                });
            }
        }
        let event = ChangeEvent::new(
            table,
            raw.operation,
            raw.record,
            raw.old_record,
            raw.commit_timestamp.unwrap_or(received_at),
        )?;
        Ok(Self {
            truncated: raw.truncated,
            ..event
        })
    }

    pub fn table(&self) -> TableName {
        self.table
    }

    pub fn operation(&self) -> ChangeOperation {
        self.operation
    }

    pub fn new_record(&self) -> Option<&Record> {
        self.new_record.as_ref()
    }

    pub fn old_record(&self) -> Option<&Record> {
        self.old_record.as_ref()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Wire name of the event, e.g. `students_updated`.
    pub fn event_name(&self) -> String {
        format!("{}_{}", self.table.as_str(), self.operation.past_tense())
    }
}

/// Notification payload as emitted by the `pg_notify` trigger.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawChange {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(rename = "type")]
    pub operation: ChangeOperation,
    #[serde(default)]
    pub record: Option<Record>,
    #[serde(default)]
    pub old_record: Option<Record>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    /// Set by the trigger when the full row did not fit in one notification
    #[serde(default)]
    pub truncated: bool,
}

impl RawChange {
    pub fn parse(payload: &str) -> Result<Self, ChangeError> {
        serde_json::from_str(payload).map_err(|err| ChangeError::Malformed(err.to_string()))
    }
}
