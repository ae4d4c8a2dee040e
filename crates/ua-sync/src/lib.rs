//! Sync pipeline orchestration: full-refresh entity loads, survey window
//! validation, store backups, and the daily poll scheduler that drives them.

use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ua_core::{
    AccessLogEntry, AssessmentItem, Availability, ContentItem, EnrollmentRecord, Entity,
    ForumPost, GradeProgressRecord, InteractionEvent,
};
use ua_extract::{
    connect_with_retry, ConnectionExhausted, MySqlConnector, MySqlSettings, RemoteConnect,
    RemoteSource, RetryPolicy,
};
use ua_storage::{BackupReport, BackupRotator, LoadReport, LocalStore};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ua-sync";

/// Wall-clock time of day (local) at which a daily job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DailyTime {
    pub hour: u32,
    pub minute: u32,
}

impl DailyTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            bail!("invalid time of day {hour:02}:{minute:02}");
        }
        Ok(Self { hour, minute })
    }

    /// Parses the `HH`/`MM` pair used by the `*_HOUR`/`*_MINUTE` variables.
    pub fn parse(hour: &str, minute: &str) -> Result<Self> {
        let h = hour
            .trim()
            .parse::<u32>()
            .with_context(|| format!("hour `{hour}` is not a number"))?;
        let m = minute
            .trim()
            .parse::<u32>()
            .with_context(|| format!("minute `{minute}` is not a number"))?;
        Self::new(h, m)
    }

    pub fn time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }

    /// First instant strictly after `after` at this time of day.
    pub fn next_after(self, after: NaiveDateTime) -> NaiveDateTime {
        let candidate = after.date().and_time(self.time());
        if candidate > after {
            candidate
        } else {
            candidate + ChronoDuration::days(1)
        }
    }
}

impl std::fmt::Display for DailyTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl LogRotation {
    /// Accepts `midnight`/`daily`/`d`, `hourly`/`h`, `minutely`/`m` and `never`.
    /// Anything else rotates daily.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "m" | "minute" | "minutely" => LogRotation::Minutely,
            "h" | "hour" | "hourly" => LogRotation::Hourly,
            "never" | "none" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

/// Maps a level name, including the `WARNING`/`CRITICAL` spellings, onto a
/// `tracing` level directive.
pub fn normalize_log_level(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" | "fatal" => Some("error"),
        "off" => Some("off"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub filename: String,
    pub level: String,
    pub rotation: LogRotation,
    pub retention: usize,
}

/// Process-wide settings, read once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub remote: MySqlSettings,
    pub local_db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub sync_at: DailyTime,
    pub validation_at: DailyTime,
    pub backup_at: DailyTime,
    pub backup_retention_days: u32,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub log: LogConfig,
    /// Values that were present but unusable and got replaced by a default.
    /// Config is read before logging exists, so the caller reports these.
    pub notices: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let get = |key: &str, default: &str| present(key).unwrap_or_else(|| default.to_string());
        let daily = |prefix: &str, default_hour: &str| {
            let hour = get(&format!("{prefix}_HOUR"), default_hour);
            let minute = get(&format!("{prefix}_MINUTE"), "00");
            DailyTime::parse(&hour, &minute)
                .with_context(|| format!("invalid {prefix}_HOUR/{prefix}_MINUTE"))
        };

        let mut notices = Vec::new();
        let port = setting(&present, "DB_PORT", 3306u16, &mut notices);
        let backup_retention_days = setting(&present, "BACKUP_RETENTION_DAYS", 7u32, &mut notices);
        let max_attempts = setting(&present, "CONNECT_MAX_ATTEMPTS", 10u32, &mut notices);
        let delay_secs = setting(&present, "CONNECT_DELAY_SECS", 3u64, &mut notices);
        let poll_secs = setting(&present, "SCHEDULER_POLL_SECS", 60u64, &mut notices);
        let log_retention = setting(&present, "LOG_RETENTION_DAYS", 7usize, &mut notices);

        let raw_level = get("LOG_LEVEL", "debug");
        let level = match normalize_log_level(&raw_level) {
            Some(level) => level,
            None => {
                notices.push(format!("LOG_LEVEL={raw_level:?} is not a known level; using debug"));
                "debug"
            }
        };

        Ok(Self {
            remote: MySqlSettings {
                host: get("DB_HOST", "localhost"),
                port,
                user: get("DB_USER", "moodle"),
                password: get("DB_PASS", "moodle"),
                database: get("DB_NAME", "moodle"),
            },
            local_db_path: PathBuf::from(get("LOCAL_DB_PATH", "./db/uniAnalytics.db")),
            backup_dir: PathBuf::from(get("BACKUP_DIR", "./backups")),
            sync_at: daily("SYNC", "00")?,
            validation_at: daily("VALIDATION", "01")?,
            backup_at: daily("BACKUP", "02")?,
            backup_retention_days,
            retry: RetryPolicy {
                max_attempts,
                delay: Duration::from_secs(delay_secs),
            },
            poll_interval: Duration::from_secs(poll_secs),
            log: LogConfig {
                dir: PathBuf::from(get("LOG_DIR", "./logs")),
                filename: get("LOG_FILENAME", "uniAnalytics.log"),
                level: level.to_string(),
                rotation: LogRotation::parse(&get("LOG_ROTATE_WHEN", "midnight")),
                retention: log_retention,
            },
            notices,
        })
    }
}

fn setting<T>(
    present: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    notices: &mut Vec<String>,
) -> T
where
    T: FromStr + std::fmt::Display,
{
    match present(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            notices.push(format!("{key}={raw:?} is not a valid value; using {default}"));
            default
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Loaded {
        entity: Entity,
        inserted: usize,
        skipped: usize,
    },
    Failed {
        entity: Entity,
        error: String,
    },
}

impl EntityOutcome {
    pub fn entity(&self) -> Entity {
        match self {
            EntityOutcome::Loaded { entity, .. } | EntityOutcome::Failed { entity, .. } => *entity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub outcomes: Vec<EntityOutcome>,
}

impl SyncRunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, EntityOutcome::Failed { .. }))
    }
}

/// Runs every entity's extract → load pair in [`Entity::SYNC_ORDER`].
pub struct SyncOrchestrator<C: RemoteConnect> {
    connector: C,
    retry: RetryPolicy,
    store: LocalStore,
}

impl<C: RemoteConnect> SyncOrchestrator<C> {
    pub fn new(connector: C, retry: RetryPolicy, store: LocalStore) -> Self {
        Self {
            connector,
            retry,
            store,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// One remote connection serves the whole cycle. If it cannot be opened no
    /// table is touched; otherwise each entity succeeds or fails on its own.
    pub async fn run_all_syncs(&self) -> Result<SyncRunSummary, ConnectionExhausted> {
        let started_at = Local::now().naive_local();
        let source = connect_with_retry(&self.connector, &self.retry).await?;

        let mut outcomes = Vec::with_capacity(Entity::SYNC_ORDER.len());
        for entity in Entity::SYNC_ORDER {
            let outcome = match self.sync_entity(&source, entity, started_at).await {
                Ok(report) => EntityOutcome::Loaded {
                    entity,
                    inserted: report.inserted,
                    skipped: report.skipped_count(),
                },
                Err(err) => {
                    error!(%entity, error = %format!("{err:#}"), "entity sync failed; continuing");
                    EntityOutcome::Failed {
                        entity,
                        error: format!("{err:#}"),
                    }
                }
            };
            outcomes.push(outcome);
        }
        source.close().await;

        Ok(SyncRunSummary {
            started_at,
            finished_at: Local::now().naive_local(),
            outcomes,
        })
    }

    async fn sync_entity(
        &self,
        source: &C::Source,
        entity: Entity,
        synced_at: NaiveDateTime,
    ) -> Result<LoadReport> {
        let rows = source
            .fetch(entity)
            .await
            .with_context(|| format!("extracting {entity}"))?;
        debug!(%entity, rows = rows.len(), "rows extracted");

        let store = &self.store;
        match entity {
            Entity::ForumPosts => store.replace_all::<ForumPost>(&rows, synced_at).await,
            Entity::Interactions => store.replace_all::<InteractionEvent>(&rows, synced_at).await,
            Entity::GradeProgress => store.replace_all::<GradeProgressRecord>(&rows, synced_at).await,
            Entity::AssessmentItems => store.replace_all::<AssessmentItem>(&rows, synced_at).await,
            Entity::Enrollments => store.replace_all::<EnrollmentRecord>(&rows, synced_at).await,
            Entity::PublishedContent => store.replace_all::<ContentItem>(&rows, synced_at).await,
            Entity::CourseAccessLogs => store.replace_all::<AccessLogEntry>(&rows, synced_at).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub evaluated: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Recomputes every efolio's survey flags from scratch for `now`.
///
/// Items with unreadable dates are logged and keep their current flags.
pub async fn validate_windows(store: &LocalStore, now: NaiveDateTime) -> Result<ValidationReport> {
    let windows = store.assessment_windows().await?;
    debug!(count = windows.len(), "efolios found for validation");

    let mut updates = Vec::with_capacity(windows.len());
    let mut skipped = 0usize;
    for window in &windows {
        let (start, end) = match window.bounds() {
            Ok(bounds) => bounds,
            Err(err) => {
                warn!(item_id = window.item_id, error = %err, "efolio skipped: unreadable dates");
                skipped += 1;
                continue;
            }
        };
        if start > end {
            warn!(item_id = window.item_id, %start, %end, "efolio ends before it starts");
        }
        let flags = Availability::evaluate(start, end, now);
        debug!(item_id = window.item_id, pre = flags.pre, pos = flags.pos, "efolio evaluated");
        updates.push((window.item_id, flags));
    }

    let updated = store.write_availability(&updates).await?;
    Ok(ValidationReport {
        evaluated: updates.len(),
        updated,
        skipped,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Validation,
    Backup,
}

impl JobKind {
    /// Each job consumes what the previous one wrote.
    pub const STARTUP_ORDER: [JobKind; 3] = [JobKind::Sync, JobKind::Validation, JobKind::Backup];

    pub fn label(self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Validation => "validation",
            JobKind::Backup => "backup",
        }
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs one job to completion. Failures end in the log, never in the caller.
    async fn run_job(&self, job: JobKind);
}

pub struct Pipeline<C: RemoteConnect> {
    orchestrator: SyncOrchestrator<C>,
    rotator: BackupRotator,
    retention_days: u32,
}

impl<C: RemoteConnect> Pipeline<C> {
    pub fn new(orchestrator: SyncOrchestrator<C>, rotator: BackupRotator, retention_days: u32) -> Self {
        Self {
            orchestrator,
            rotator,
            retention_days,
        }
    }

    pub fn store(&self) -> &LocalStore {
        self.orchestrator.store()
    }

    pub async fn run_sync(&self) -> Result<SyncRunSummary, ConnectionExhausted> {
        self.orchestrator.run_all_syncs().await
    }

    pub async fn run_validation(&self) -> Result<ValidationReport> {
        validate_windows(self.store(), Local::now().naive_local()).await
    }

    pub async fn run_backup(&self) -> Result<BackupReport> {
        self.rotator.backup_and_prune(self.retention_days).await
    }
}

#[async_trait]
impl<C: RemoteConnect> JobRunner for Pipeline<C> {
    async fn run_job(&self, job: JobKind) {
        let span = info_span!("job", job = job.label(), run_id = %Uuid::new_v4());
        async {
            info!("job started");
            match job {
                JobKind::Sync => match self.run_sync().await {
                    Ok(summary) => {
                        let failed = summary.failed().count();
                        info!(entities = summary.outcomes.len(), failed, "sync complete");
                    }
                    Err(err) => error!(error = %err, "sync skipped for this cycle"),
                },
                JobKind::Validation => match self.run_validation().await {
                    Ok(report) => info!(
                        evaluated = report.evaluated,
                        updated = report.updated,
                        skipped = report.skipped,
                        "form availability check complete"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "form availability check failed"),
                },
                JobKind::Backup => match self.run_backup().await {
                    Ok(report) => info!(
                        snapshot = %report.snapshot.path.display(),
                        pruned = report.pruned.len(),
                        "backup complete"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "backup failed"),
                },
            }
            info!("job finished");
        }
        .instrument(span)
        .await
    }
}

/// Opens the local store and wires the MySQL-backed pipeline described by `config`.
pub async fn pipeline_from_config(config: &AppConfig) -> Result<Pipeline<MySqlConnector>> {
    let store = LocalStore::open(&config.local_db_path).await?;
    let orchestrator = SyncOrchestrator::new(
        MySqlConnector::new(config.remote.clone()),
        config.retry,
        store,
    );
    let rotator = BackupRotator::new(&config.local_db_path, &config.backup_dir);
    Ok(Pipeline::new(orchestrator, rotator, config.backup_retention_days))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledJob {
    job: JobKind,
    at: DailyTime,
    next_run: NaiveDateTime,
}

/// Once-a-day triggers for each job, evaluated by polling.
#[derive(Debug, Clone)]
pub struct DailySchedule {
    jobs: Vec<ScheduledJob>,
}

impl DailySchedule {
    pub fn new(times: &[(JobKind, DailyTime)], now: NaiveDateTime) -> Self {
        Self {
            jobs: times
                .iter()
                .map(|&(job, at)| ScheduledJob {
                    job,
                    at,
                    next_run: at.next_after(now),
                })
                .collect(),
        }
    }

    pub fn from_config(config: &AppConfig, now: NaiveDateTime) -> Self {
        Self::new(
            &[
                (JobKind::Sync, config.sync_at),
                (JobKind::Validation, config.validation_at),
                (JobKind::Backup, config.backup_at),
            ],
            now,
        )
    }

    pub fn next_run(&self, job: JobKind) -> Option<NaiveDateTime> {
        self.jobs.iter().find(|j| j.job == job).map(|j| j.next_run)
    }

    /// Jobs whose trigger time has passed, earliest first; each is moved to its next day.
    pub fn due_jobs(&mut self, now: NaiveDateTime) -> Vec<JobKind> {
        let mut due: Vec<(NaiveDateTime, JobKind)> = self
            .jobs
            .iter()
            .filter(|j| j.next_run <= now)
            .map(|j| (j.next_run, j.job))
            .collect();
        due.sort();

        for scheduled in self.jobs.iter_mut().filter(|j| j.next_run <= now) {
            scheduled.next_run = scheduled.at.next_after(now);
        }
        due.into_iter().map(|(_, job)| job).collect()
    }
}

/// Single-threaded poll loop; jobs never overlap because each is awaited in turn.
pub struct Scheduler {
    schedule: DailySchedule,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(schedule: DailySchedule, poll_interval: Duration) -> Self {
        Self {
            schedule,
            poll_interval,
        }
    }

    pub fn schedule(&self) -> &DailySchedule {
        &self.schedule
    }

    pub async fn run_startup<R: JobRunner>(runner: &R) {
        for job in JobKind::STARTUP_ORDER {
            info!(job = job.label(), "running job at scheduler start");
            runner.run_job(job).await;
        }
    }

    /// Runs the startup jobs against a schedule armed beforehand, so a trigger
    /// time that passes during the run-through is due on the first tick.
    pub async fn start<R: JobRunner>(
        runner: &R,
        schedule: DailySchedule,
        poll_interval: Duration,
    ) -> Self {
        let scheduler = Self::new(schedule, poll_interval);
        Self::run_startup(runner).await;
        scheduler
    }

    pub async fn tick<R: JobRunner>(&mut self, runner: &R, now: NaiveDateTime) -> Vec<JobKind> {
        let due = self.schedule.due_jobs(now);
        for job in &due {
            runner.run_job(*job).await;
        }
        due
    }

    /// Polls until `shutdown` resolves. Shutdown is only observed between polls.
    pub async fn run_until<R, F>(&mut self, runner: &R, shutdown: F)
    where
        R: JobRunner,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            self.tick(runner, Local::now().naive_local()).await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }
}
