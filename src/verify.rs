//! Verification results and reporting

use parking_lot::Mutex;
use std::fmt;

/// Width of the bracketed status column in report rows
pub const STATUS_WIDTH: usize = 19;

/// Outcome of comparing one entry across the local/remote boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    Ok,
    MissingLocal,
    MissingRemote,
    SizeMismatch,
    ChecksumMismatch,
    NotDirectory,
    NotFile,
    LinkMismatch,
}

impl VerificationResult {
    pub fn is_ok(self) -> bool {
        self == VerificationResult::Ok
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            VerificationResult::Ok => "OK",
            VerificationResult::MissingLocal => "MISSING LOCAL",
            VerificationResult::MissingRemote => "MISSING REMOTE",
            VerificationResult::SizeMismatch => "SIZE MISMATCH",
            VerificationResult::ChecksumMismatch => "CHECKSUM MISMATCH",
            VerificationResult::NotDirectory => "NOT DIRECTORY",
            VerificationResult::NotFile => "NOT FILE",
            VerificationResult::LinkMismatch => "LINK MISMATCH",
        };
        f.write_str(token)
    }
}

/// One row of a verification report
#[derive(Debug, Clone)]
pub struct VerifiedEntry {
    pub path: String,
    pub result: VerificationResult,
}

/// All per-entry results of one verification pass
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub entries: Vec<VerifiedEntry>,
}

impl VerifyReport {
    pub fn all_match(&self) -> bool {
        self.entries.iter().all(|e| e.result.is_ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Report sink shared by concurrent verifiers
#[derive(Default)]
pub struct ReportCollector {
    entries: Mutex<Vec<VerifiedEntry>>,
}

impl ReportCollector {
    pub fn record(&self, path: String, result: VerificationResult) {
        self.entries.lock().push(VerifiedEntry { path, result });
    }

    pub fn into_report(self) -> VerifyReport {
        VerifyReport {
            entries: self.entries.into_inner(),
        }
    }

    pub fn snapshot(&self) -> VerifyReport {
        VerifyReport {
            entries: self.entries.lock().clone(),
        }
    }
}

/// Center `text` within `width`, padding with spaces
pub fn centered(text: &str, width: usize) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let pad = width - text.len();
    let left = pad / 2;
    format!("{}{}{}", " ".repeat(left), text, " ".repeat(pad - left))
}

/// Format one `[ RESULT ] path` report row
pub fn report_row(result: VerificationResult, detail: &str) -> String {
    format!("[{}] {}", centered(&result.to_string(), STATUS_WIDTH), detail)
}
