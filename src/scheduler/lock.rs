//! File-based single-runner lock for scheduler leadership.
//!
//! The lock file holds the owner PID on the first line and an ISO-8601 UTC
//! timestamp on the second. A lock is stale when its PID is no longer alive,
//! or when `stale_after` has elapsed since the timestamp. Acquisition never
//! blocks: losing the race simply means this process runs as a follower.

use chrono::{DateTime, Utc};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct SchedulerLock {
    path: PathBuf,
    stale_after: Option<Duration>,
    held: bool,
}

impl SchedulerLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            stale_after,
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to become the leader. Returns true on success.
    pub fn try_acquire(&mut self) -> bool {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && std::fs::create_dir_all(parent).is_err() {
                return false;
            }
        }

        if self.path.exists() {
            let owner_pid = read_pid(&self.path);
            let timestamp = read_timestamp(&self.path);

            let is_stale = match (self.stale_after, timestamp) {
                (Some(stale_after), Some(written_at)) => {
                    let age = Utc::now().signed_duration_since(written_at);
                    age.to_std().map(|age| age > stale_after).unwrap_or(false)
                }
                _ => false,
            };

            let owner_alive = owner_pid.map(is_process_alive).unwrap_or(false);
            if owner_alive && !is_stale {
                return false;
            }

            // Stale or ownerless lock: clear it before racing for the path.
            if std::fs::remove_file(&self.path).is_err() {
                return false;
            }
            tracing::info!(
                path = %self.path.display(),
                owner_pid = ?owner_pid,
                stale = is_stale,
                "removed stale scheduler lock"
            );
        }

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            // Another process won the race for the path.
            Err(_) => return false,
        };

        let content = format!(
            "{}\n{}\n",
            std::process::id(),
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
        );
        if file.write_all(content.as_bytes()).is_err() {
            let _ = std::fs::remove_file(&self.path);
            return false;
        }

        self.held = true;
        tracing::info!(path = %self.path.display(), "scheduler leader lock acquired");
        true
    }

    /// Release the lock if held. Best effort: a missing file is not an error.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %error, "failed to remove scheduler lock");
            }
        } else {
            tracing::info!(path = %self.path.display(), "scheduler leader lock released");
        }
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.lines().next()?.trim().parse::<u32>().ok()
}

fn read_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let content = std::fs::read_to_string(path).ok()?;
    let raw = content.lines().nth(1)?.trim();
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

/// kill(pid, 0) checks if the process exists without sending a signal.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Without a liveness probe, treat existing locks as live; staleness by age
/// still applies.
#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("scheduler.lock")
    }

    #[test]
    fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = SchedulerLock::new(lock_path(&dir), None);

        assert!(lock.try_acquire());
        assert!(lock.is_held());
        assert!(lock_path(&dir).exists());

        let content = std::fs::read_to_string(lock_path(&dir)).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap().parse::<u32>().unwrap(),
            std::process::id()
        );
        DateTime::parse_from_rfc3339(lines.next().unwrap()).expect("second line is a timestamp");

        lock.release();
        assert!(!lock.is_held());
        assert!(!lock_path(&dir).exists());
    }

    #[test]
    fn second_acquire_fails_while_owner_alive() {
        let dir = tempfile::tempdir().unwrap();
        let mut leader = SchedulerLock::new(lock_path(&dir), None);
        assert!(leader.try_acquire());

        // Same process, same live PID: the follower must lose.
        let mut follower = SchedulerLock::new(lock_path(&dir), None);
        assert!(!follower.try_acquire());
        assert!(!follower.is_held());
    }

    #[test]
    fn stale_by_age_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        // A lock written long ago by a (still live) process.
        let old = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(
            &path,
            format!(
                "{}\n{}\n",
                std::process::id(),
                old.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            ),
        )
        .unwrap();

        let mut lock = SchedulerLock::new(&path, Some(Duration::from_secs(60)));
        assert!(lock.try_acquire());
    }

    #[test]
    fn dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        // PID 0 never passes the liveness probe.
        std::fs::write(
            &path,
            format!(
                "0\n{}\n",
                Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            ),
        )
        .unwrap();

        let mut lock = SchedulerLock::new(&path, None);
        assert!(lock.try_acquire());
    }

    #[test]
    fn garbage_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        std::fs::write(&path, "not a pid\n").unwrap();

        let mut lock = SchedulerLock::new(&path, None);
        assert!(lock.try_acquire());
    }

    #[test]
    fn release_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        {
            let mut lock = SchedulerLock::new(&path, None);
            assert!(lock.try_acquire());
        }
        assert!(!path.exists());
    }
}
