//! JSON output structures for the modsync CLI

use modsync_sync::{ScanOutcome, SyncOutcome, SyncReport};
use serde::Serialize;
use std::collections::BTreeMap;

/// Complete JSON output for a sync run
#[derive(Debug, Serialize)]
pub struct SyncReportJson {
    /// Operation metadata
    pub metadata: OperationMetadata,
    /// Transfer statistics
    pub stats: SyncStatsJson,
    /// Downloaded bytes per pack
    pub packs: BTreeMap<String, u64>,
    /// Overall result
    pub result: OperationResult,
}

/// Operation metadata
#[derive(Debug, Serialize)]
pub struct OperationMetadata {
    /// modsync version
    pub version: String,
    /// Operation type
    pub operation: String,
    /// Run identifier
    pub run_id: String,
    /// Timestamp when the operation started
    pub timestamp: String,
    /// Whether this was a dry run
    pub dry_run: bool,
}

/// Sync statistics in JSON format
#[derive(Debug, Serialize)]
pub struct SyncStatsJson {
    /// Files fully downloaded
    pub files_downloaded: usize,
    /// Bytes of fully downloaded files
    pub bytes_downloaded: u64,
    /// Files deleted locally
    pub files_deleted: usize,
    /// Files already current
    pub files_up_to_date: usize,
    /// Files left unfinished by faults
    pub files_failed: usize,
    /// Files left unfinished by the interrupt
    pub files_cancelled: usize,
    /// Files the run planned to download
    pub files_planned: usize,
    /// Files found on the remote
    pub files_scanned: usize,
    /// Duration in milliseconds
    pub duration_ms: u128,
    /// Average transfer rate in bytes per second
    pub average_speed_bps: f64,
}

/// Overall operation result
#[derive(Debug, Serialize)]
pub struct OperationResult {
    /// Final state
    pub status: OutcomeJson,
    /// Every underlying fault message
    pub errors: Vec<String>,
}

/// Final state in JSON format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeJson {
    /// Everything planned was done
    Completed,
    /// Some work faulted
    PartialSuccess,
    /// Interrupted
    Cancelled,
    /// Nothing useful happened
    Failed,
}

impl From<SyncOutcome> for OutcomeJson {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Completed => Self::Completed,
            SyncOutcome::PartialSuccess => Self::PartialSuccess,
            SyncOutcome::Cancelled => Self::Cancelled,
            SyncOutcome::Failed => Self::Failed,
        }
    }
}

impl SyncReportJson {
    /// Build the JSON view of a report
    pub fn from_report(report: &SyncReport) -> Self {
        Self {
            metadata: OperationMetadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                operation: "sync".to_string(),
                run_id: report.run_id.to_string(),
                timestamp: report.started_at.to_rfc3339(),
                dry_run: report.dry_run,
            },
            stats: SyncStatsJson {
                files_downloaded: report.files_downloaded,
                bytes_downloaded: report.bytes_downloaded,
                files_deleted: report.files_deleted,
                files_up_to_date: report.files_up_to_date,
                files_failed: report.files_failed,
                files_cancelled: report.files_cancelled,
                files_planned: report.files_planned,
                files_scanned: report.scan.files_found,
                duration_ms: report.elapsed.as_millis(),
                average_speed_bps: report.average_speed,
            },
            packs: report.pack_bytes.clone(),
            result: OperationResult {
                status: report.outcome.into(),
                errors: report
                    .fault
                    .iter()
                    .flat_map(|fault| fault.faults())
                    .map(ToString::to_string)
                    .collect(),
            },
        }
    }
}

/// JSON output for `modsync scan`
#[derive(Debug, Serialize)]
pub struct ScanResultJson {
    /// Files found
    pub files: usize,
    /// Total size of all files
    pub total_bytes: u64,
    /// Directories listed
    pub directories_listed: u64,
    /// Listings that came back non-empty after an empty one
    pub recovered_listings: u64,
    /// Every directory was listed
    pub complete: bool,
    /// Duration in milliseconds
    pub duration_ms: u128,
    /// Worker faults
    pub errors: Vec<String>,
}

impl ScanResultJson {
    /// Build the JSON view of a scan
    pub fn from_outcome(outcome: &ScanOutcome) -> Self {
        Self {
            files: outcome.index.len(),
            total_bytes: outcome.total_bytes(),
            directories_listed: outcome.stats.directories_listed,
            recovered_listings: outcome.stats.recovered_listings,
            complete: outcome.complete,
            duration_ms: outcome.elapsed.as_millis(),
            errors: outcome.faults.iter().map(ToString::to_string).collect(),
        }
    }
}
