//! Persistent data model and storage (SQLite).

pub mod executions;
pub mod jobs;
pub mod notifications;
pub mod slack;
pub mod taxonomy;
pub mod users;

pub use executions::{ExecutionStatus, ExecutionStore, ExecutionType, JobExecution, TriggerType};
pub use jobs::{CreateJobInput, Job, JobStore};
pub use notifications::{Notification, NotificationKind, NotificationStore};
pub use slack::{SlackSettings, SlackStore};
pub use taxonomy::{JobCategory, PicTeam, TaxonomyStore};
pub use users::UserStore;
