mod cell;
mod ids;
mod schedule;
mod task;

pub use cell::StatusCell;
pub use ids::{FileHash, IdError, ServiceName, SubmissionId};
pub use schedule::{Schedule, ServiceProfile, Stage};
pub use task::{
    CompletedNotice, FailureStatus, FileRecord, FileTask, ServiceError, ServiceResult,
    ServiceTask, Submission, SubmissionParams, SubmissionState, SubmissionTask,
};
