//! Notification fan-out: in-app broadcasts, Slack webhook posts, and the
//! mail-sink collaborator seam.

pub mod broadcast;
pub mod mail;
pub mod slack;

pub use broadcast::Notifier;
pub use mail::{MailSink, NullMailSink};
pub use slack::send_slack_message;
