//! Types shared by the engine API and its formatters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rendering of the PositionUpdate stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Comma-separated rows with a header
    Csv,
    /// Compact human-readable line
    Text,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "text" => Ok(OutputFormat::Text),
            other => Err(format!("unknown output format '{other}' (expected json, csv or text)")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Text => "text",
        })
    }
}

/// Outcome of one compute cycle over the pending batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Batches that produced a PositionUpdate
    pub computed: usize,
    /// Batches with no usable reading, or whose device expired in between
    pub skipped: usize,
}
