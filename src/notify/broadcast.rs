//! In-app notification fan-out.
//!
//! Broadcasts insert one row per known user. Targeted job warnings
//! (auto-pause, ending-soon) go to the job's creator plus every active admin.

use crate::error::Result;
use crate::store::jobs::Job;
use crate::store::notifications::{NotificationKind, NotificationStore};
use crate::store::users::UserStore;
use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Notifier {
    notifications: NotificationStore,
    users: UserStore,
}

impl Notifier {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            notifications: NotificationStore::new(pool.clone()),
            users: UserStore::new(pool),
        }
    }

    /// Insert one notification per known user. Returns the number created.
    pub async fn broadcast(
        &self,
        title: &str,
        message: &str,
        kind: NotificationKind,
        related_job_id: Option<&str>,
        related_execution_id: Option<&str>,
    ) -> Result<usize> {
        let user_ids = self.users.list_all_ids().await?;
        let mut created = 0;
        for user_id in &user_ids {
            self.notifications
                .create(user_id, title, message, kind, related_job_id, related_execution_id)
                .await?;
            created += 1;
        }
        Ok(created)
    }

    /// Warning to the job's creator and every active admin, deduplicated.
    pub async fn warn_job_recipients(
        &self,
        job: &Job,
        title: &str,
        message: &str,
    ) -> Result<usize> {
        let mut recipients: BTreeSet<String> = BTreeSet::new();
        if let Some(creator) = &job.created_by {
            recipients.insert(creator.clone());
        }
        for admin_id in self.users.list_active_admin_ids().await? {
            recipients.insert(admin_id);
        }

        let mut created = 0;
        for user_id in &recipients {
            self.notifications
                .create(
                    user_id,
                    title,
                    message,
                    NotificationKind::Warning,
                    Some(&job.id),
                    None,
                )
                .await?;
            created += 1;
        }
        Ok(created)
    }

    /// "Job auto-paused (end date passed)" warning for an expired job.
    pub async fn job_auto_paused(
        &self,
        job: &Job,
        end_date: NaiveDate,
        tz_label: &str,
    ) -> Result<usize> {
        let message = format!(
            "Job \"{}\" passed its end_date ({} {tz_label}) and was auto-paused. PIC Team: {}",
            job.name,
            end_date,
            job.pic_team.as_deref().unwrap_or("-"),
        );
        self.warn_job_recipients(job, "Job auto-paused (end date passed)", &message)
            .await
    }

    /// "Job ending soon" weekly reminder.
    pub async fn job_ending_soon(
        &self,
        job: &Job,
        end_date: NaiveDate,
        days_left: i64,
        tz_label: &str,
    ) -> Result<usize> {
        let message = format!(
            "Job \"{}\" ends on {} {tz_label} ({days_left} day(s) left). PIC Team: {}",
            job.name,
            end_date,
            job.pic_team.as_deref().unwrap_or("-"),
        );
        self.warn_job_recipients(job, "Job ending soon", &message).await
    }

    pub async fn job_completed(
        &self,
        job_name: &str,
        job_id: &str,
        execution_id: &str,
    ) -> Result<usize> {
        self.broadcast(
            "Job Completed",
            &format!("Job \"{job_name}\" completed successfully."),
            NotificationKind::Success,
            Some(job_id),
            Some(execution_id),
        )
        .await
    }

    pub async fn job_failed(
        &self,
        job_name: &str,
        job_id: &str,
        execution_id: &str,
        error_message: &str,
    ) -> Result<usize> {
        self.broadcast(
            "Job Failed",
            &format!("Job \"{job_name}\" failed: {error_message}"),
            NotificationKind::Error,
            Some(job_id),
            Some(execution_id),
        )
        .await
    }

    pub async fn job_created(&self, job_name: &str, job_id: &str, by: &str) -> Result<usize> {
        self.broadcast(
            "New Job Created",
            &format!("Job \"{job_name}\" was created by {by}."),
            NotificationKind::Info,
            Some(job_id),
            None,
        )
        .await
    }

    pub async fn job_updated(&self, job_name: &str, job_id: &str, by: &str) -> Result<usize> {
        self.broadcast(
            "Job Updated",
            &format!("Job \"{job_name}\" was updated by {by}."),
            NotificationKind::Info,
            Some(job_id),
            None,
        )
        .await
    }

    pub async fn job_deleted(&self, job_name: &str, by: &str) -> Result<usize> {
        self.broadcast(
            "Job Deleted",
            &format!("Job \"{job_name}\" was deleted by {by}."),
            NotificationKind::Warning,
            None,
            None,
        )
        .await
    }

    pub async fn job_enabled(&self, job_name: &str, job_id: &str, by: &str) -> Result<usize> {
        self.broadcast(
            "Job Enabled",
            &format!("Job \"{job_name}\" was enabled by {by}."),
            NotificationKind::Info,
            Some(job_id),
            None,
        )
        .await
    }

    pub async fn job_disabled(&self, job_name: &str, job_id: &str, by: &str) -> Result<usize> {
        self.broadcast(
            "Job Disabled",
            &format!("Job \"{job_name}\" was disabled by {by}."),
            NotificationKind::Warning,
            Some(job_id),
            None,
        )
        .await
    }
}
