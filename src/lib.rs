pub mod batch;
pub mod config;
pub mod dataset;
pub mod doc_template;
pub mod error;
pub mod idcard;
pub mod images;
pub mod merge;
pub mod naming;
pub mod ooxml;
pub mod placeholder;
pub mod sheet_template;

pub use batch::{BatchRequest, BatchSummary, CancellationToken};
pub use config::JobConfig;
pub use dataset::TabularDataset;
pub use doc_template::{DocRenderOptions, LogEntry, RunStyle, SubstitutionStatus};
pub use error::{Error, Result};
pub use merge::MultiTableCollection;
pub use sheet_template::{ImageFillMode, SheetRenderOptions};
