//! Entity types shared by the adapters and the coordination core.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mapping from logical output-file name to a text chunk contributed by one
/// row. Chunks for the same logical name are concatenated in `line` order
/// when the batch is summarized.
pub type BlobRows = HashMap<String, String>;

/// Mapping from logical output-file name to the opaque object-store id the
/// assembled file was uploaded under.
pub type OutputFiles = HashMap<String, String>;

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Inprog,
    Wait,
    Success,
    Failed,
    Aborted,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Inprog => "inprog",
            BatchStatus::Wait => "wait",
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
            BatchStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Success | BatchStatus::Failed | BatchStatus::Aborted
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "inprog" => Ok(BatchStatus::Inprog),
            "wait" => Ok(BatchStatus::Wait),
            "success" => Ok(BatchStatus::Success),
            "failed" => Ok(BatchStatus::Failed),
            "aborted" => Ok(BatchStatus::Aborted),
            other => anyhow::bail!("unknown batch status: {}", other),
        }
    }
}

/// Lifecycle of a single row. Terminal states never change (a recovered row
/// re-enters `queued` only from `inprog`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Queued,
    Inprog,
    Success,
    Failed,
    Aborted,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Queued => "queued",
            RowStatus::Inprog => "inprog",
            RowStatus::Success => "success",
            RowStatus::Failed => "failed",
            RowStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RowStatus::Success | RowStatus::Failed | RowStatus::Aborted
        )
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RowStatus::Queued),
            "inprog" => Ok(RowStatus::Inprog),
            "success" => Ok(RowStatus::Success),
            "failed" => Ok(RowStatus::Failed),
            "aborted" => Ok(RowStatus::Aborted),
            other => anyhow::bail!("unknown row status: {}", other),
        }
    }
}

/// A submitted unit of work: one or more rows sharing `(app, op, context)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub app: String,
    pub op: String,
    pub context: Value,
    pub inputfile: Option<String>,
    pub status: BatchStatus,
    pub reqat: DateTime<Utc>,
    pub doneat: Option<DateTime<Utc>>,
    pub outputfiles: Option<OutputFiles>,
    pub nsuccess: Option<i32>,
    pub nfailed: Option<i32>,
    pub naborted: Option<i32>,
}

/// One processable input within a batch. `line == 0` marks the single row of
/// a slow-query batch; ordinary batch rows start at `line == 1`.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub rowid: i64,
    pub batch: String,
    pub line: i32,
    pub input: Value,
    pub status: RowStatus,
    pub reqat: DateTime<Utc>,
    pub doneat: Option<DateTime<Utc>>,
    pub res: Option<Value>,
    pub blobrows: Option<BlobRows>,
    pub messages: Option<Vec<ErrorMessage>>,
    pub doneby: Option<String>,
}

impl BatchRow {
    pub fn is_slow_query(&self) -> bool {
        self.line == 0
    }
}

/// A row claimed by `fetch_block_of_rows`, joined with its batch header.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub app: String,
    pub op: String,
    pub context: Value,
    pub batch: String,
    pub rowid: i64,
    pub line: i32,
    pub input: Value,
    pub status: RowStatus,
}

impl ClaimedRow {
    pub fn is_slow_query(&self) -> bool {
        self.line == 0
    }
}

/// Structured error reported to the submitter, composed by the core for
/// configuration errors and by processors for domain errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub msgid: i32,
    pub errcode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vals: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ErrorMessage {
    pub fn new(msgid: i32, errcode: impl Into<String>) -> Self {
        Self {
            msgid,
            errcode: errcode.into(),
            vals: Vec::new(),
            field: None,
        }
    }

    pub fn with_vals(mut self, vals: Vec<String>) -> Self {
        self.vals = vals;
        self
    }
}

/// Snapshot of a terminal batch handed to `mark_done`.
#[derive(Debug, Clone)]
pub struct BatchDetails {
    pub id: String,
    pub app: String,
    pub op: String,
    pub context: Value,
    pub status: BatchStatus,
    pub output_files: OutputFiles,
    pub n_success: i32,
    pub n_failed: i32,
    pub n_aborted: i32,
}

/// JSON blob cached under the per-batch summary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub status: BatchStatus,
    #[serde(default)]
    pub output_files: OutputFiles,
    pub n_success: i32,
    pub n_failed: i32,
    pub n_aborted: i32,
}

/// Result of one `do_batch_job` invocation.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    /// Terminal row status; `queued`/`inprog` are not valid processor results.
    pub status: RowStatus,
    pub res: Value,
    pub messages: Vec<ErrorMessage>,
    pub blobrows: BlobRows,
}

impl BatchOutput {
    pub fn success(res: Value) -> Self {
        Self {
            status: RowStatus::Success,
            res,
            messages: Vec::new(),
            blobrows: BlobRows::new(),
        }
    }

    pub fn failed(res: Value, messages: Vec<ErrorMessage>) -> Self {
        Self {
            status: RowStatus::Failed,
            res,
            messages,
            blobrows: BlobRows::new(),
        }
    }

    pub fn with_blobrows(mut self, blobrows: BlobRows) -> Self {
        self.blobrows = blobrows;
        self
    }
}

/// Result of one `do_slow_query` invocation.
#[derive(Debug, Clone)]
pub struct SlowQueryOutput {
    pub status: RowStatus,
    pub res: Value,
    pub messages: Vec<ErrorMessage>,
    pub output_files: OutputFiles,
}

/// Poll-facing status: every non-terminal database state maps to `TryLater`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneStatus {
    TryLater,
    Success,
    Failed,
    Aborted,
}

impl From<BatchStatus> for DoneStatus {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Queued | BatchStatus::Inprog | BatchStatus::Wait => DoneStatus::TryLater,
            BatchStatus::Success => DoneStatus::Success,
            BatchStatus::Failed => DoneStatus::Failed,
            BatchStatus::Aborted => DoneStatus::Aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_round_trips_through_str() {
        for status in [
            BatchStatus::Queued,
            BatchStatus::Inprog,
            BatchStatus::Wait,
            BatchStatus::Success,
            BatchStatus::Failed,
            BatchStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(BatchStatus::Success.is_terminal());
        assert!(BatchStatus::Aborted.is_terminal());
        assert!(!BatchStatus::Wait.is_terminal());
        assert!(RowStatus::Failed.is_terminal());
        assert!(!RowStatus::Inprog.is_terminal());
    }

    #[test]
    fn nonterminal_batch_statuses_map_to_try_later() {
        assert_eq!(DoneStatus::from(BatchStatus::Queued), DoneStatus::TryLater);
        assert_eq!(DoneStatus::from(BatchStatus::Inprog), DoneStatus::TryLater);
        assert_eq!(DoneStatus::from(BatchStatus::Wait), DoneStatus::TryLater);
        assert_eq!(DoneStatus::from(BatchStatus::Failed), DoneStatus::Failed);
    }

    #[test]
    fn error_message_serde_omits_empty_fields() {
        let msg = ErrorMessage::new(100, "DOMAIN");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"msgid": 100, "errcode": "DOMAIN"}));

        let full = ErrorMessage {
            msgid: 7,
            errcode: "bad_field".into(),
            vals: vec!["x".into()],
            field: Some("amount".into()),
        };
        let back: ErrorMessage =
            serde_json::from_value(serde_json::to_value(&full).unwrap()).unwrap();
        assert_eq!(back, full);
    }
}
