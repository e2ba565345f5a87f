//! cdcflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Value types, errors and logging shared by the cdcflow workspace members.
//!
//! # Overview
//!
//! - **Records**: [`Record`] and its variants, the unit the CDC pipeline moves
//! - **Positions**: [`IngestPosition`], the resumable cursor carried by every record
//! - **Error Handling**: [`PipelineError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup
//!
//! # Example
//!
//! ```
//! use cdcflow_common::{Column, DataRecord, DataRecordType, IngestPosition, Record};
//!
//! let record: Record = DataRecord::new(DataRecordType::Insert, "t_order", IngestPosition::log("", 1))
//!     .with_column(Column::key("order_id", 1))
//!     .with_column(Column::value("status", "NEW"))
//!     .into();
//!
//! assert!(record.is_insert());
//! ```

pub mod error;
pub mod logging;
pub mod position;
pub mod record;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use position::{IngestPosition, KeyBound};
pub use record::{Column, DataRecord, DataRecordType, FinishedRecord, PlaceholderRecord, Record};
