//! PositionUpdate output formatting
//!
//! JSON lines for downstream consumers, CSV for data logging and a compact
//! text form for humans watching the stream.

use serde::Serialize;

use crate::api::types::OutputFormat;
use crate::core::PositionUpdate;
use crate::registry::AnonymizedExport;

/// Rounded, serializable view of one update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedUpdate {
    pub device_id: String,
    pub x: f64,
    pub y: f64,
    pub zone_id: String,
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub timestamp_ms: i64,
}

/// Renders updates in the configured format
#[derive(Debug, Clone)]
pub struct PositionFormatter {
    pub format: OutputFormat,
    /// Decimal places kept for coordinates
    pub precision: u8,
}

impl Default for PositionFormatter {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            precision: 3,
        }
    }
}

impl PositionFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    /// Line printed once before the first update, if the format has one
    pub fn header(&self) -> Option<String> {
        match self.format {
            OutputFormat::Csv => Some(CsvFormatter::header()),
            OutputFormat::Json | OutputFormat::Text => None,
        }
    }

    pub fn prepare(&self, update: &PositionUpdate) -> FormattedUpdate {
        FormattedUpdate {
            device_id: update.device_id.to_string(),
            x: self.round_to_precision(update.x),
            y: self.round_to_precision(update.y),
            zone_id: update.zone_id.to_string(),
            timestamp: update.timestamp.to_rfc3339(),
            timestamp_ms: update.timestamp.timestamp_millis(),
        }
    }

    pub fn render(&self, update: &PositionUpdate) -> Result<String, serde_json::Error> {
        let formatted = self.prepare(update);
        match self.format {
            OutputFormat::Json => JsonFormatter::new().format_json(&formatted),
            OutputFormat::Csv => Ok(CsvFormatter::format_csv(&formatted)),
            OutputFormat::Text => Ok(TextFormatter::format_text(&formatted)),
        }
    }

    fn round_to_precision(&self, value: f64) -> f64 {
        let multiplier = 10_f64.powi(self.precision as i32);
        (value * multiplier).round() / multiplier
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    pub fn format_json<T: Serialize>(&self, value: &T) -> Result<String, serde_json::Error> {
        if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
    }

    /// Anonymized export of the registry
    pub fn format_export(&self, export: &AnonymizedExport) -> Result<String, serde_json::Error> {
        self.format_json(export)
    }
}

pub struct CsvFormatter;

impl CsvFormatter {
    pub fn header() -> String {
        "timestamp_ms,timestamp,device_id,x,y,zone_id".to_string()
    }

    pub fn format_csv(update: &FormattedUpdate) -> String {
        format!(
            "{},{},{},{},{},{}",
            update.timestamp_ms,
            update.timestamp,
            update.device_id,
            update.x,
            update.y,
            csv_field(&update.zone_id)
        )
    }
}

/// Quote a field containing a separator, quote or newline
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub struct TextFormatter;

impl TextFormatter {
    pub fn format_text(update: &FormattedUpdate) -> String {
        format!(
            "{} {} ({}, {}) zone={}",
            update.timestamp, update.device_id, update.x, update.y, update.zone_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceId, ZoneId};
    use chrono::{TimeZone, Utc};

    fn update() -> PositionUpdate {
        PositionUpdate {
            device_id: DeviceId::from_hex("3f9a0c17d2e4b851".into()),
            x: 4.123456,
            y: 7.0,
            zone_id: ZoneId::new("lobby"),
            timestamp: Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_json_line() {
        let line = PositionFormatter::new(OutputFormat::Json).render(&update()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["device_id"], "3f9a0c17d2e4b851");
        assert_eq!(value["x"], 4.123);
        assert_eq!(value["zone_id"], "lobby");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_csv_row_matches_header() {
        let formatter = PositionFormatter::new(OutputFormat::Csv);
        let header = formatter.header().unwrap();
        let row = formatter.render(&update()).unwrap();
        assert_eq!(header.split(',').count(), row.split(',').count());
        assert!(row.ends_with(",4.123,7,lobby"));
    }

    #[test]
    fn test_csv_quotes_zone_with_comma() {
        let mut u = update();
        u.zone_id = ZoneId::new("hall, north");
        let row = PositionFormatter::new(OutputFormat::Csv).render(&u).unwrap();
        assert!(row.ends_with(",\"hall, north\""));
    }

    #[test]
    fn test_text_line() {
        let formatter = PositionFormatter::new(OutputFormat::Text).with_precision(1);
        let line = formatter.render(&update()).unwrap();
        assert_eq!(line, "2026-10-19T09:30:00+00:00 3f9a0c17d2e4b851 (4.1, 7) zone=lobby");
        assert!(formatter.header().is_none());
    }
}
