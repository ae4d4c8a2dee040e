//! Local analytics store (SQLite) and file-level snapshot rotation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions,
};
use sqlx::{Row, Transaction};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use ua_core::{
    format_local_datetime, AccessLogEntry, AssessmentItem, AssessmentWindow, Availability,
    ContentItem, EnrollmentRecord, Entity, ForumPost, GradeProgressRecord, InteractionEvent,
    RawRow, SyncRecord,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ua-storage";

pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A record that knows how to insert itself into its local table.
pub trait LocalTable: SyncRecord + Serialize + Send + Sync {
    const INSERT_SQL: &'static str;

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;

    /// Key under which validator-owned flags are carried across a reload.
    fn carried_item_id(&self) -> Option<i64> {
        None
    }

    fn carry_availability(&mut self, _prior: Availability) {}
}

impl LocalTable for ForumPost {
    const INSERT_SQL: &'static str = "INSERT INTO forum \
        (post_id, user_id, role, course_id, post_type, parent, time_created, time_updated) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.post_id)
            .bind(self.user_id)
            .bind(self.role.as_str())
            .bind(self.course_id)
            .bind(self.post_type.as_str())
            .bind(self.parent_post_id)
            .bind(format_local_datetime(self.created_at))
            .bind(format_local_datetime(self.updated_at))
    }
}

impl LocalTable for InteractionEvent {
    const INSERT_SQL: &'static str = "INSERT INTO interacao \
        (user_id, course_id, tipo_interacao, time_created, time_updated) \
        VALUES (?, ?, ?, ?, ?)";

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.user_id)
            .bind(self.course_id)
            .bind(self.interaction_type.as_str())
            .bind(format_local_datetime(self.created_at))
            .bind(format_local_datetime(self.updated_at))
    }
}

impl LocalTable for GradeProgressRecord {
    const INSERT_SQL: &'static str = "INSERT INTO grade_progress \
        (course_module_id, course_id, module_type, user_id, completion_state, item_name, \
         group_id, group_name, final_grade, time_created, time_updated) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.course_module_id)
            .bind(self.course_id)
            .bind(self.module_type.as_str())
            .bind(self.user_id)
            .bind(self.completion_state)
            .bind(self.item_name.as_deref())
            .bind(self.group_id)
            .bind(self.group_name.as_deref())
            .bind(self.final_grade)
            .bind(format_local_datetime(self.created_at))
            .bind(format_local_datetime(self.updated_at))
    }
}

impl LocalTable for AssessmentItem {
    const INSERT_SQL: &'static str = "INSERT INTO efolios \
        (item_id, name, course_id, course_name, start_date, end_date, available_pre, \
         available_pos, time_created, time_updated) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.item_id)
            .bind(self.name.as_str())
            .bind(self.course_id)
            .bind(self.course_name.as_str())
            .bind(format_local_datetime(self.start_date))
            .bind(format_local_datetime(self.end_date))
            .bind(self.available_pre)
            .bind(self.available_pos)
            .bind(format_local_datetime(self.created_at))
            .bind(format_local_datetime(self.updated_at))
    }

    fn carried_item_id(&self) -> Option<i64> {
        Some(self.item_id)
    }

    fn carry_availability(&mut self, prior: Availability) {
        self.available_pre = prior.pre;
        self.available_pos = prior.pos;
    }
}

impl LocalTable for EnrollmentRecord {
    const INSERT_SQL: &'static str = "INSERT INTO course_data \
        (user_id, email, name, role, course_id, course_name, group_name, time_created, time_updated) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.user_id)
            .bind(self.email.as_str())
            .bind(self.name.as_str())
            .bind(self.role.as_str())
            .bind(self.course_id)
            .bind(self.course_name.as_str())
            .bind(self.group_name.as_deref())
            .bind(format_local_datetime(self.created_at))
            .bind(format_local_datetime(self.updated_at))
    }
}

impl LocalTable for ContentItem {
    const INSERT_SQL: &'static str = "INSERT INTO conteudos_disponibilizados \
        (course_module_id, course_id, module_type, time_created, time_updated) \
        VALUES (?, ?, ?, ?, ?)";

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.course_module_id)
            .bind(self.course_id)
            .bind(self.module_type.as_str())
            .bind(format_local_datetime(self.created_at))
            .bind(format_local_datetime(self.updated_at))
    }
}

impl LocalTable for AccessLogEntry {
    const INSERT_SQL: &'static str = "INSERT INTO course_access_logs \
        (user_id, name, role, course_id, course_name, access_time, time_updated) \
        VALUES (?, ?, ?, ?, ?, ?, ?)";

    fn bind_row<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.user_id)
            .bind(self.name.as_str())
            .bind(self.role.as_str())
            .bind(self.course_id)
            .bind(self.course_name.as_str())
            .bind(format_local_datetime(self.access_time))
            .bind(format_local_datetime(self.updated_at))
    }
}

/// A row dropped from a load, with the contents that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    pub row: RawRow,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub entity: Entity,
    pub inserted: usize,
    pub skipped: Vec<SkippedRow>,
}

impl LoadReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Splits extracted rows into typed records and the rows that failed coercion.
pub fn coerce_rows<T: SyncRecord>(
    rows: &[RawRow],
    synced_at: NaiveDateTime,
) -> (Vec<T>, Vec<SkippedRow>) {
    rows.iter().fold(
        (Vec::with_capacity(rows.len()), Vec::new()),
        |(mut records, mut skipped), raw| {
            match T::from_raw(raw, synced_at) {
                Ok(record) => records.push(record),
                Err(err) => skipped.push(SkippedRow {
                    row: raw.clone(),
                    reason: err.to_string(),
                }),
            }
            (records, skipped)
        },
    )
}

fn record_as_raw<T: Serialize>(record: &T) -> RawRow {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map.into(),
        _ => RawRow::new(),
    }
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl LocalStore {
    /// Opens (creating if needed) the database file and applies the schema.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating local store directory {}", parent.display()))?;
        }

        // Rollback journal keeps the whole database in one file, so snapshots are plain copies.
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening local store {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("applying local store schema")?;

        debug!(path = %path.display(), "local store ready");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Full refresh of one entity table.
    ///
    /// Delete and reinsert share one transaction, so readers see either the
    /// previous rows or the new ones. Rows that fail coercion or insertion are
    /// reported in the returned [`LoadReport`] and never abort the load; an error
    /// is returned only when the transaction itself fails, leaving the table as it was.
    pub async fn replace_all<T: LocalTable>(
        &self,
        rows: &[RawRow],
        synced_at: NaiveDateTime,
    ) -> anyhow::Result<LoadReport> {
        let entity = T::ENTITY;
        let (mut records, mut skipped) = coerce_rows::<T>(rows, synced_at);

        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("starting {entity} load transaction"))?;

        if entity == Entity::AssessmentItems {
            let prior = availability_by_item(&mut tx).await?;
            for record in &mut records {
                if let Some(flags) = record.carried_item_id().and_then(|id| prior.get(&id)) {
                    record.carry_availability(*flags);
                }
            }
        }

        let delete_sql = format!("DELETE FROM {}", entity.table());
        sqlx::query(&delete_sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clearing {}", entity.table()))?;

        let mut inserted = 0usize;
        for record in &records {
            match record
                .bind_row(sqlx::query(T::INSERT_SQL))
                .execute(&mut *tx)
                .await
            {
                Ok(_) => inserted += 1,
                Err(err) => skipped.push(SkippedRow {
                    row: record_as_raw(record),
                    reason: err.to_string(),
                }),
            }
        }

        tx.commit()
            .await
            .with_context(|| format!("committing {entity} load"))?;

        for skip in &skipped {
            warn!(%entity, reason = %skip.reason, row = %skip.row, "row skipped");
        }
        info!(%entity, inserted, skipped = skipped.len(), "table refreshed");

        Ok(LoadReport {
            entity,
            inserted,
            skipped,
        })
    }

    pub async fn count(&self, entity: Entity) -> anyhow::Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity.table());
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting {}", entity.table()))?;
        Ok(count)
    }

    pub async fn assessment_windows(&self) -> anyhow::Result<Vec<AssessmentWindow>> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, CAST(start_date AS TEXT) AS start_date, CAST(end_date AS TEXT) AS end_date
              FROM efolios
             ORDER BY item_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("reading efolio windows")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AssessmentWindow {
                item_id: row.try_get("item_id")?,
                start_date: row.try_get::<Option<String>, _>("start_date")?.unwrap_or_default(),
                end_date: row.try_get::<Option<String>, _>("end_date")?.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Writes availability flags one item at a time; returns how many items were updated.
    pub async fn write_availability(&self, updates: &[(i64, Availability)]) -> anyhow::Result<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting availability transaction")?;

        let mut written = 0usize;
        for (item_id, flags) in updates {
            let result = sqlx::query(
                "UPDATE efolios SET available_pre = ?, available_pos = ? WHERE item_id = ?",
            )
            .bind(flags.pre)
            .bind(flags.pos)
            .bind(item_id)
            .execute(&mut *tx)
            .await;
            match result {
                Ok(done) if done.rows_affected() > 0 => {
                    debug!(item_id, pre = flags.pre, pos = flags.pos, "availability updated");
                    written += 1;
                }
                Ok(_) => debug!(item_id, "efolio vanished before availability update"),
                Err(err) => warn!(item_id, error = %err, "availability update failed"),
            }
        }

        tx.commit().await.context("committing availability flags")?;
        Ok(written)
    }

    pub async fn availability(&self, item_id: i64) -> anyhow::Result<Option<Availability>> {
        let row = sqlx::query("SELECT available_pre, available_pos FROM efolios WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading availability for efolio {item_id}"))?;
        row.map(|row| -> anyhow::Result<Availability> {
            Ok(Availability {
                pre: row.try_get::<Option<bool>, _>("available_pre")?.unwrap_or(false),
                pos: row.try_get::<Option<bool>, _>("available_pos")?.unwrap_or(false),
            })
        })
        .transpose()
    }
}

async fn availability_by_item(
    tx: &mut Transaction<'_, Sqlite>,
) -> anyhow::Result<HashMap<i64, Availability>> {
    let rows = sqlx::query("SELECT item_id, available_pre, available_pos FROM efolios")
        .fetch_all(&mut **tx)
        .await
        .context("reading current efolio availability")?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let item_id: i64 = row.try_get("item_id")?;
        out.insert(
            item_id,
            Availability {
                pre: row.try_get::<Option<bool>, _>("available_pre")?.unwrap_or(false),
                pos: row.try_get::<Option<bool>, _>("available_pos")?.unwrap_or(false),
            },
        );
    }
    Ok(out)
}

pub const SNAPSHOT_PREFIX: &str = "backup_";
pub const SNAPSHOT_EXTENSION: &str = "db";
const SNAPSHOT_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub snapshot: Snapshot,
    pub pruned: Vec<PathBuf>,
}

/// Copies the local store file into timestamped snapshots and ages old ones out.
#[derive(Debug, Clone)]
pub struct BackupRotator {
    source: PathBuf,
    backup_dir: PathBuf,
}

impl BackupRotator {
    /// Snapshots land in `<backups_root>/<database file stem>/`.
    pub fn new(source: impl Into<PathBuf>, backups_root: impl AsRef<Path>) -> Self {
        let source = source.into();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local_db".to_string());
        Self {
            backup_dir: backups_root.as_ref().join(stem),
            source,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_file_name(taken_at: NaiveDateTime) -> String {
        format!(
            "{SNAPSHOT_PREFIX}{}.{SNAPSHOT_EXTENSION}",
            taken_at.format(SNAPSHOT_STAMP_FORMAT)
        )
    }

    pub fn is_snapshot_name(name: &str) -> bool {
        name.strip_prefix(SNAPSHOT_PREFIX)
            .and_then(|rest| rest.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}")))
            .map(|stamp| NaiveDateTime::parse_from_str(stamp, SNAPSHOT_STAMP_FORMAT).is_ok())
            .unwrap_or(false)
    }

    /// Byte-for-byte copy of the store file, written to a temp file and renamed into place.
    pub async fn snapshot(&self, taken_at: NaiveDateTime) -> anyhow::Result<Snapshot> {
        fs::create_dir_all(&self.backup_dir)
            .await
            .with_context(|| format!("creating backup directory {}", self.backup_dir.display()))?;

        let bytes = fs::read(&self.source)
            .await
            .with_context(|| format!("reading local store {}", self.source.display()))?;
        let path = self.backup_dir.join(Self::snapshot_file_name(taken_at));
        let temp_path = self
            .backup_dir
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming snapshot {} -> {}", temp_path.display(), path.display())
            });
        }

        Ok(Snapshot {
            path,
            byte_size: bytes.len(),
            sha256: Self::sha256_hex(&bytes),
        })
    }

    /// Deletes snapshots whose modification time is strictly older than `now - retention`.
    pub async fn prune(&self, now: SystemTime, retention: Duration) -> anyhow::Result<Vec<PathBuf>> {
        let Some(threshold) = now.checked_sub(retention) else {
            return Ok(Vec::new());
        };

        let mut entries = fs::read_dir(&self.backup_dir)
            .await
            .with_context(|| format!("listing {}", self.backup_dir.display()))?;
        let mut pruned = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.backup_dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !Self::is_snapshot_name(&name) {
                continue;
            }
            let path = entry.path();
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .with_context(|| format!("reading modification time of {}", path.display()))?;
            if modified < threshold {
                fs::remove_file(&path)
                    .await
                    .with_context(|| format!("removing old snapshot {}", path.display()))?;
                info!(file = %name, "old backup removed");
                pruned.push(path);
            }
        }
        pruned.sort();
        Ok(pruned)
    }

    pub async fn backup_and_prune(&self, retention_days: u32) -> anyhow::Result<BackupReport> {
        let snapshot = self.snapshot(Local::now().naive_local()).await?;
        info!(
            path = %snapshot.path.display(),
            bytes = snapshot.byte_size,
            sha256 = %snapshot.sha256,
            "backup created"
        );

        let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let pruned = self.prune(SystemTime::now(), retention).await?;
        info!(removed = pruned.len(), retention_days, "backup cleanup finished");

        Ok(BackupReport { snapshot, pruned })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use ua_core::parse_local_datetime;

    fn ts(s: &str) -> NaiveDateTime {
        parse_local_datetime(s).unwrap()
    }

    async fn open_store(dir: &Path) -> LocalStore {
        LocalStore::open(dir.join("db").join("uniAnalytics.db"))
            .await
            .expect("open store")
    }

    fn grade_row(module: i64, user: i64, grade: serde_json::Value) -> RawRow {
        RawRow::new()
            .with("course_module_id", module)
            .with("course_id", 2)
            .with("module_type", "quiz")
            .with("user_id", user)
            .with("completion_state", 1)
            .with("item_name", "Quiz 1")
            .with("group_id", json!(null))
            .with("group_name", json!(null))
            .with("final_grade", grade)
            .with("time_created", "2024-02-01 10:00:00")
    }

    fn efolio_row(item_id: i64, start: &str, end: &str) -> RawRow {
        RawRow::new()
            .with("item_id", item_id)
            .with("name", format!("e-folio {item_id}"))
            .with("course_id", 4)
            .with("course_name", "Algebra")
            .with("start_date", start)
            .with("end_date", end)
            .with("time_created", "2024-01-10 09:00:00")
    }

    async fn grades(store: &LocalStore) -> Vec<(i64, i64, Option<f64>)> {
        sqlx::query_as(
            "SELECT course_module_id, user_id, final_grade FROM grade_progress \
             ORDER BY course_module_id, user_id",
        )
        .fetch_all(store.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_grade_is_skipped_and_rest_loaded() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let rows = vec![
            grade_row(1, 10, json!("4.5")),
            grade_row(1, 11, json!("not-a-number")),
            grade_row(2, 10, json!(null)),
        ];

        let report = store
            .replace_all::<GradeProgressRecord>(&rows, ts("2024-03-01 00:00:00"))
            .await
            .expect("load");

        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped[0].row, rows[1]);
        assert_eq!(grades(&store).await, vec![(1, 10, Some(4.5)), (2, 10, None)]);
    }

    #[tokio::test]
    async fn reloading_same_rows_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let rows = vec![grade_row(1, 10, json!(3.0)), grade_row(1, 10, json!(3.0))];
        let synced_at = ts("2024-03-01 00:00:00");

        store.replace_all::<GradeProgressRecord>(&rows, synced_at).await.unwrap();
        let once = grades(&store).await;
        store.replace_all::<GradeProgressRecord>(&rows, synced_at).await.unwrap();
        let twice = grades(&store).await;

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2, "duplicate join rows are kept");
    }

    #[tokio::test]
    async fn failed_clear_keeps_previous_rows() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let synced_at = ts("2024-03-01 00:00:00");
        store
            .replace_all::<GradeProgressRecord>(
                &[grade_row(1, 10, json!(1.0)), grade_row(2, 10, json!(2.0))],
                synced_at,
            )
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER grade_progress_locked BEFORE DELETE ON grade_progress \
             BEGIN SELECT RAISE(ABORT, 'grade_progress is locked'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let result = store
            .replace_all::<GradeProgressRecord>(&[grade_row(9, 99, json!(9.0))], synced_at)
            .await;

        let err = result.expect_err("clear must fail");
        assert!(format!("{err:#}").contains("grade_progress"));
        assert_eq!(
            grades(&store).await,
            vec![(1, 10, Some(1.0)), (2, 10, Some(2.0))]
        );
    }

    #[tokio::test]
    async fn refresh_replaces_previous_rows_entirely() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let synced_at = ts("2024-03-01 00:00:00");

        store
            .replace_all::<GradeProgressRecord>(
                &[grade_row(1, 10, json!(1.0)), grade_row(2, 10, json!(2.0))],
                synced_at,
            )
            .await
            .unwrap();
        store
            .replace_all::<GradeProgressRecord>(&[grade_row(3, 12, json!(5.0))], synced_at)
            .await
            .unwrap();

        assert_eq!(grades(&store).await, vec![(3, 12, Some(5.0))]);
        store.replace_all::<GradeProgressRecord>(&[], synced_at).await.unwrap();
        assert_eq!(store.count(Entity::GradeProgress).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_primary_key_is_counted_as_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let post = RawRow::new()
            .with("post_id", 5)
            .with("user_id", 1)
            .with("role", "student")
            .with("course_id", 2)
            .with("parent", 0)
            .with("time_created", 1_700_000_000);

        let report = store
            .replace_all::<ForumPost>(&[post.clone(), post], ts("2024-03-01 00:00:00"))
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(store.count(Entity::ForumPosts).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn efolio_reload_keeps_validator_flags() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let synced_at = ts("2024-03-01 00:00:00");
        let first = [efolio_row(1, "2024-03-15 00:00:00", "2024-03-22 00:00:00")];
        store.replace_all::<AssessmentItem>(&first, synced_at).await.unwrap();

        let flags = Availability { pre: true, pos: false };
        assert_eq!(store.write_availability(&[(1, flags)]).await.unwrap(), 1);

        let second = [
            efolio_row(1, "2024-03-15 00:00:00", "2024-03-23 00:00:00"),
            efolio_row(2, "2024-04-01 00:00:00", "2024-04-08 00:00:00"),
        ];
        store.replace_all::<AssessmentItem>(&second, synced_at).await.unwrap();

        assert_eq!(store.availability(1).await.unwrap(), Some(flags));
        assert_eq!(store.availability(2).await.unwrap(), Some(Availability::default()));
        let windows = store.assessment_windows().await.unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].end_date, "2024-03-23 00:00:00");
    }

    #[tokio::test]
    async fn availability_update_for_unknown_item_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let written = store
            .write_availability(&[(99, Availability { pre: true, pos: true })])
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(store.availability(99).await.unwrap(), None);
    }

    #[test]
    fn snapshot_names_embed_the_timestamp() {
        let name = BackupRotator::snapshot_file_name(ts("2024-03-08 07:05:09"));
        assert_eq!(name, "backup_20240308_070509.db");
        assert!(BackupRotator::is_snapshot_name(&name));
        assert!(!BackupRotator::is_snapshot_name("backup_latest.db"));
        assert!(!BackupRotator::is_snapshot_name("notes.txt"));
    }

    #[tokio::test]
    async fn snapshot_copies_store_bytes_verbatim() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("uniAnalytics.db");
        std::fs::write(&source, b"sqlite bytes").unwrap();
        let rotator = BackupRotator::new(&source, dir.path().join("backups"));

        let snapshot = rotator.snapshot(ts("2024-03-08 00:00:00")).await.unwrap();

        assert_eq!(rotator.backup_dir(), dir.path().join("backups").join("uniAnalytics"));
        assert_eq!(snapshot.path, rotator.backup_dir().join("backup_20240308_000000.db"));
        assert_eq!(std::fs::read(&snapshot.path).unwrap(), b"sqlite bytes");
        assert_eq!(snapshot.sha256, BackupRotator::sha256_hex(b"sqlite bytes"));
    }

    #[tokio::test]
    async fn prune_removes_only_snapshots_past_retention() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("uniAnalytics.db");
        std::fs::write(&source, b"x").unwrap();
        let rotator = BackupRotator::new(&source, dir.path().join("backups"));
        std::fs::create_dir_all(rotator.backup_dir()).unwrap();

        let day = Duration::from_secs(24 * 60 * 60);
        // whole seconds, so coarse filesystem timestamps cannot shift the 7-day boundary
        let epoch_secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(epoch_secs);
        let mut by_age = Vec::new();
        for (i, age) in [1u32, 6, 7, 8, 10].into_iter().enumerate() {
            let path = rotator
                .backup_dir()
                .join(format!("backup_2024010{}_000000.db", i + 1));
            let file = std::fs::File::create(&path).unwrap();
            file.set_modified(now - day * age).unwrap();
            by_age.push((age, path));
        }
        let unrelated = rotator.backup_dir().join("readme.txt");
        let file = std::fs::File::create(&unrelated).unwrap();
        file.set_modified(now - day * 30).unwrap();

        let pruned = rotator.prune(now, day * 7).await.unwrap();

        let expected: Vec<PathBuf> = by_age
            .iter()
            .filter(|(age, _)| *age > 7)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(pruned, expected);
        for (age, path) in &by_age {
            assert_eq!(path.exists(), *age <= 7, "snapshot aged {age}d");
        }
        assert!(unrelated.exists());
    }
}
