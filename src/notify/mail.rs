//! Mail-sink collaborator seam.
//!
//! SMTP delivery lives outside this crate. The dispatcher only enqueues
//! through this trait when a job's notification fields ask for it, and never
//! waits on the result.

use async_trait::async_trait;

#[async_trait]
pub trait MailSink: Send + Sync {
    async fn send_job_success(
        &self,
        job_name: &str,
        job_id: &str,
        duration_seconds: f64,
        recipients: &[String],
    );

    async fn send_job_failure(
        &self,
        job_name: &str,
        job_id: &str,
        error_message: &str,
        recipients: &[String],
    );
}

/// Default sink: logs the enqueue and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMailSink;

#[async_trait]
impl MailSink for NullMailSink {
    async fn send_job_success(
        &self,
        job_name: &str,
        job_id: &str,
        duration_seconds: f64,
        recipients: &[String],
    ) {
        tracing::debug!(
            job_id,
            job_name,
            duration_seconds,
            recipient_count = recipients.len(),
            "mail sink not configured, dropping success notification"
        );
    }

    async fn send_job_failure(
        &self,
        job_name: &str,
        job_id: &str,
        error_message: &str,
        recipients: &[String],
    ) {
        tracing::debug!(
            job_id,
            job_name,
            error_message,
            recipient_count = recipients.len(),
            "mail sink not configured, dropping failure notification"
        );
    }
}
