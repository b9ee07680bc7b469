//! Engine surface: registry worker, scheduled activities and output formatting

pub mod engine;
pub mod formatting;
pub mod scheduler;
pub mod types;

pub use engine::{Engine, EngineHandle};
pub use formatting::{CsvFormatter, FormattedUpdate, JsonFormatter, PositionFormatter, TextFormatter};
pub use types::{CycleReport, OutputFormat};
