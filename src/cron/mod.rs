//! Cron jobs
//!
//! Persisted schedules that synthesize envelopes into the lane scheduler,
//! so agents can be poked on an interval or at a daily time without any
//! inbound traffic.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routing::{ChatKind, Envelope};
use crate::scheduler::LaneScheduler;
use crate::session::SessionKey;
use crate::{Error, Result};

/// How often the scheduler loop checks for due jobs
const SWEEP_INTERVAL: Duration = Duration::from_secs(20);

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// Every `secs` seconds
    Interval { secs: u64 },
    /// Once a day at `HH:MM` UTC
    Daily { at: String },
}

/// One persisted cron job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub schedule: CronSchedule,
    /// Agent that receives the synthesized envelope
    pub agent_id: String,
    /// Message text the agent is prompted with
    pub text: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

const fn default_enabled() -> bool {
    true
}

impl CronJob {
    /// Is this job due at `now`?
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.schedule {
            CronSchedule::Interval { secs } => self.last_run.is_none_or(|last| {
                let elapsed = (now - last).num_seconds();
                elapsed >= 0 && (elapsed as u64) >= *secs
            }),
            CronSchedule::Daily { at } => {
                let Ok(time) = NaiveTime::parse_from_str(at, "%H:%M") else {
                    return false;
                };
                let boundary = now.date_naive().and_time(time).and_utc();
                now >= boundary && self.last_run.is_none_or(|last| last < boundary)
            }
        }
    }
}

/// Persisted cron store plus the firing loop
pub struct CronService {
    path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
}

impl CronService {
    /// Open the store (missing file is an empty job list).
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    /// All jobs
    ///
    /// # Errors
    ///
    /// Returns an error when the job lock is poisoned.
    pub fn list(&self) -> Result<Vec<CronJob>> {
        Ok(self.lock()?.clone())
    }

    /// Add a job
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn add(&self, schedule: CronSchedule, agent_id: &str, text: &str) -> Result<CronJob> {
        let job = CronJob {
            id: Uuid::new_v4(),
            schedule,
            agent_id: agent_id.to_string(),
            text: text.to_string(),
            enabled: true,
            last_run: None,
        };
        let mut jobs = self.lock()?;
        jobs.push(job.clone());
        self.persist(&jobs)?;
        Ok(job)
    }

    /// Update mutable fields of a job
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids.
    pub fn update(
        &self,
        id: Uuid,
        schedule: Option<CronSchedule>,
        text: Option<String>,
        enabled: Option<bool>,
    ) -> Result<CronJob> {
        let mut jobs = self.lock()?;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| Error::NotFound(format!("cron job {id}")))?;
        if let Some(schedule) = schedule {
            job.schedule = schedule;
        }
        if let Some(text) = text {
            job.text = text;
        }
        if let Some(enabled) = enabled {
            job.enabled = enabled;
        }
        let out = job.clone();
        self.persist(&jobs)?;
        Ok(out)
    }

    /// Remove a job
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids.
    pub fn remove(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(Error::NotFound(format!("cron job {id}")));
        }
        self.persist(&jobs)
    }

    /// Fire a job immediately, regardless of schedule
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids.
    pub fn run_now(&self, id: Uuid, scheduler: &LaneScheduler) -> Result<()> {
        let job = {
            let jobs = self.lock()?;
            jobs.iter()
                .find(|j| j.id == id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("cron job {id}")))?
        };
        self.fire(&job, scheduler)?;
        self.mark_ran(id)
    }

    /// Start the firing loop
    pub fn start(self: std::sync::Arc<Self>, scheduler: LaneScheduler) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let now = Utc::now();
                let due: Vec<CronJob> = match self.lock() {
                    Ok(jobs) => jobs.iter().filter(|j| j.is_due(now)).cloned().collect(),
                    Err(_) => continue,
                };
                for job in due {
                    tracing::info!(job = %job.id, agent = %job.agent_id, "cron job due");
                    if let Err(e) = self.fire(&job, &scheduler) {
                        tracing::warn!(job = %job.id, error = %e, "cron fire failed");
                    }
                    let _ = self.mark_ran(job.id);
                }
            }
        });
    }

    /// Synthesize the envelope and enqueue it on the job's topic session
    fn fire(&self, job: &CronJob, scheduler: &LaneScheduler) -> Result<()> {
        let session_key = SessionKey::main_topic(&job.agent_id, &format!("cron-{}", job.id));
        let envelope = Envelope {
            channel: "cron".to_string(),
            account: "cron".to_string(),
            peer: job.id.to_string(),
            chat_kind: ChatKind::Dm,
            group: None,
            from_display: "cron".to_string(),
            timestamp: Utc::now(),
            text: job.text.clone(),
            attachments: Vec::new(),
            reply_to: None,
            mentions: Vec::new(),
        };
        scheduler.enqueue(&session_key, envelope)
    }

    fn mark_ran(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.lock()?;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.last_run = Some(Utc::now());
        }
        self.persist(&jobs)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<CronJob>>> {
        self.jobs
            .lock()
            .map_err(|_| Error::Internal("cron lock poisoned".to_string()))
    }

    fn persist(&self, jobs: &[CronJob]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(jobs)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, CronService) {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::open(dir.path().join("cron.json")).unwrap();
        (dir, service)
    }

    #[test]
    fn interval_due_logic() {
        let mut job = CronJob {
            id: Uuid::new_v4(),
            schedule: CronSchedule::Interval { secs: 3600 },
            agent_id: "a1".to_string(),
            text: "check in".to_string(),
            enabled: true,
            last_run: None,
        };
        let now = Utc::now();
        assert!(job.is_due(now));

        job.last_run = Some(now - chrono::Duration::minutes(30));
        assert!(!job.is_due(now));

        job.last_run = Some(now - chrono::Duration::hours(2));
        assert!(job.is_due(now));

        job.enabled = false;
        assert!(!job.is_due(now));
    }

    #[test]
    fn daily_due_logic() {
        let now = Utc::now();
        let earlier = (now - chrono::Duration::hours(1)).time();
        let job = CronJob {
            id: Uuid::new_v4(),
            schedule: CronSchedule::Daily {
                at: earlier.format("%H:%M").to_string(),
            },
            agent_id: "a1".to_string(),
            text: "daily".to_string(),
            enabled: true,
            last_run: Some(now - chrono::Duration::days(1)),
        };
        assert!(job.is_due(now));

        let ran = CronJob {
            last_run: Some(now),
            ..job
        };
        assert!(!ran.is_due(now));
    }

    #[test]
    fn crud_round_trip() {
        let (_dir, service) = service();
        let job = service
            .add(CronSchedule::Interval { secs: 60 }, "a1", "ping")
            .unwrap();
        assert_eq!(service.list().unwrap().len(), 1);

        let updated = service
            .update(job.id, None, Some("pong".to_string()), Some(false))
            .unwrap();
        assert_eq!(updated.text, "pong");
        assert!(!updated.enabled);

        service.remove(job.id).unwrap();
        assert!(service.list().unwrap().is_empty());
        assert!(service.remove(job.id).is_err());
    }

    #[test]
    fn jobs_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.json");
        {
            let service = CronService::open(&path).unwrap();
            service
                .add(CronSchedule::Daily { at: "09:00".to_string() }, "a1", "brief")
                .unwrap();
        }
        let service = CronService::open(&path).unwrap();
        let jobs = service.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].agent_id, "a1");
    }
}
