//! Typed in-memory models for the durable state shared by the pipeline.

pub mod history;
pub mod process;
pub mod schedule;
pub mod task;
pub mod tenant;

pub use history::{AttemptOutcome, DocumentHistory, HistoryDetails};
pub use process::{
    is_valid_document_number, is_valid_process_number, legacy_timestamp, AccessType,
    CategoryStatus, DocumentRecord, DocumentStatus, LinkCheck, LinkRecord, LinkResult, LinkStatus,
    ObservedDocument, Process, VisitOutcome, RESTRICTED_CATEGORY,
};
pub use schedule::{parse_cron, parse_interval, ExtractionSchedule, ScheduleKind};
pub use task::{
    DownloadOutcome, DownloadTask, ExtractionSummary, ExtractionTask, RequestedDocuments,
    TaskStatus,
};
pub use tenant::{Credentials, Tenant};
