//! Remote LMS connection handling and per-entity extraction queries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{Number, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row};
use thiserror::Error;
use tracing::{debug, info, warn};
use ua_core::{format_local_datetime, Entity, RawRow};

pub const CRATE_NAME: &str = "ua-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("remote connection failed: {0}")]
    Connect(String),
    #[error("query for {entity} failed: {source}")]
    Query {
        entity: Entity,
        #[source]
        source: sqlx::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// Raised once every connection attempt has failed; aborts the current sync cycle.
#[derive(Debug, Error)]
#[error("remote database unreachable after {attempts} attempts: {last_error}")]
pub struct ConnectionExhausted {
    pub attempts: u32,
    pub last_error: String,
}

/// Fixed-delay retry bound for opening the remote connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Runs the entity's read query and returns its rows untouched.
    async fn fetch(&self, entity: Entity) -> Result<Vec<RawRow>, ExtractError>;

    async fn close(&self) {}
}

#[async_trait]
pub trait RemoteConnect: Send + Sync {
    type Source: RemoteSource;

    /// A single connection attempt; retrying is the caller's job.
    async fn connect(&self) -> Result<Self::Source, ExtractError>;
}

pub async fn connect_with_retry<C: RemoteConnect>(
    connector: &C,
    policy: &RetryPolicy,
) -> Result<C::Source, ConnectionExhausted> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match connector.connect().await {
            Ok(source) => {
                info!(attempt, "connected to remote LMS database");
                return Ok(source);
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "remote connection attempt failed");
                last_error = err.to_string();
                if attempt < max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(ConnectionExhausted {
        attempts: max_attempts,
        last_error,
    })
}

#[derive(Clone)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl std::fmt::Debug for MySqlSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl MySqlSettings {
    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

#[derive(Debug, Clone)]
pub struct MySqlConnector {
    settings: MySqlSettings,
}

impl MySqlConnector {
    pub fn new(settings: MySqlSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RemoteConnect for MySqlConnector {
    type Source = MySqlSource;

    async fn connect(&self) -> Result<MySqlSource, ExtractError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(self.settings.connect_options())
            .await
            .map_err(|err| ExtractError::Connect(err.to_string()))?;
        Ok(MySqlSource { pool })
    }
}

#[derive(Debug, Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
}

#[async_trait]
impl RemoteSource for MySqlSource {
    /// A failing query is logged and yields no rows, so the entity is refreshed to empty.
    async fn fetch(&self, entity: Entity) -> Result<Vec<RawRow>, ExtractError> {
        debug!(%entity, "fetching rows from remote LMS");
        match sqlx::query(remote_query(entity)).fetch_all(&self.pool).await {
            Ok(rows) => Ok(rows.iter().map(row_to_raw).collect()),
            Err(source) => {
                let err = ExtractError::Query { entity, source };
                warn!(%entity, error = %err, "extraction failed; treating entity as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Read-only query against the Moodle schema for one entity.
pub fn remote_query(entity: Entity) -> &'static str {
    match entity {
        Entity::ForumPosts => {
            r#"
            SELECT
                p.id AS post_id,
                u.id AS user_id,
                COALESCE(r.shortname, 'none') AS role,
                f.course AS course_id,
                p.parent AS parent,
                p.created AS time_created
              FROM mdl_forum_posts p
              JOIN mdl_forum_discussions d ON p.discussion = d.id
              JOIN mdl_forum f ON d.forum = f.id
              JOIN mdl_user u ON p.userid = u.id
              LEFT JOIN mdl_context ctx ON ctx.contextlevel = 50 AND ctx.instanceid = f.course
              LEFT JOIN mdl_role_assignments ra ON ra.contextid = ctx.id AND ra.userid = u.id
              LEFT JOIN mdl_role r ON r.id = ra.roleid
             WHERE u.deleted = 0
            "#
        }
        Entity::Interactions => {
            r#"
            SELECT
                l.userid AS user_id,
                l.courseid AS course_id,
                CONCAT(l.component, ':', l.target, ':', l.action) AS interaction_type,
                l.timecreated AS time_created
              FROM mdl_logstore_standard_log l
              JOIN mdl_user u ON u.id = l.userid
             WHERE u.deleted = 0
               AND l.courseid > 1
               AND l.crud IN ('c', 'u', 'd')
            "#
        }
        Entity::GradeProgress => {
            r#"
            WITH single_group AS (
                SELECT gm.userid, g.id AS group_id, g.name AS group_name, g.courseid
                  FROM mdl_groups_members gm
                  JOIN mdl_groups g ON g.id = gm.groupid
            )
            SELECT
                cm.id AS course_module_id,
                cm.course AS course_id,
                cm.added AS time_created,
                m.name AS module_type,
                cmc.userid AS user_id,
                cmc.completionstate AS completion_state,
                COALESCE(gi.itemname, CONCAT('[ID ', cm.id, ']')) AS item_name,
                sg.group_id AS group_id,
                sg.group_name AS group_name,
                CAST(gg.finalgrade AS CHAR) AS final_grade
              FROM mdl_course_modules cm
              JOIN mdl_modules m ON m.id = cm.module
              JOIN mdl_course_modules_completion cmc ON cm.id = cmc.coursemoduleid
              LEFT JOIN mdl_grade_items gi
                ON gi.iteminstance = cm.instance
               AND gi.itemtype = 'mod'
               AND gi.itemmodule = m.name
               AND gi.courseid = cm.course
              LEFT JOIN mdl_grade_grades gg ON gg.itemid = gi.id AND gg.userid = cmc.userid
              LEFT JOIN single_group sg ON sg.userid = cmc.userid AND sg.courseid = cm.course
             WHERE cm.completion > 0
            "#
        }
        Entity::AssessmentItems => {
            r#"
            SELECT
                gi.id AS item_id,
                a.name AS name,
                a.course AS course_id,
                c.fullname AS course_name,
                FROM_UNIXTIME(a.allowsubmissionsfromdate) AS start_date,
                FROM_UNIXTIME(a.duedate) AS end_date,
                FROM_UNIXTIME(gi.timemodified) AS time_created
              FROM mdl_assign a
              JOIN mdl_grade_items gi ON gi.iteminstance = a.id
              JOIN mdl_course c ON c.id = a.course
             WHERE gi.itemmodule = 'assign' AND a.name LIKE '%folio%'
            "#
        }
        Entity::Enrollments => {
            r#"
            SELECT
                u.id AS user_id,
                u.email AS email,
                CONCAT(u.firstname, ' ', u.lastname) AS name,
                r.shortname AS role,
                c.id AS course_id,
                c.fullname AS course_name,
                MAX(g.name) AS group_name,
                u.timecreated AS time_created
              FROM mdl_user u
              JOIN mdl_role_assignments ra ON ra.userid = u.id
              JOIN mdl_context ctx ON ctx.id = ra.contextid AND ctx.contextlevel = 50
              JOIN mdl_course c ON c.id = ctx.instanceid
              JOIN mdl_role r ON r.id = ra.roleid
              LEFT JOIN mdl_groups_members gm ON gm.userid = u.id
              LEFT JOIN mdl_groups g ON g.id = gm.groupid AND g.courseid = c.id
             GROUP BY u.id, u.email, name, r.shortname, c.id, c.fullname, u.timecreated
             ORDER BY course_id, role, name
            "#
        }
        Entity::PublishedContent => {
            r#"
            SELECT
                cm.id AS course_module_id,
                cm.course AS course_id,
                cm.added AS time_created,
                m.name AS module_type
              FROM mdl_course_modules cm
              JOIN mdl_modules m ON m.id = cm.module
             WHERE m.name IN ('resource', 'page', 'url', 'book', 'folder', 'quiz', 'lesson', 'forum', 'scorm')
            "#
        }
        Entity::CourseAccessLogs => {
            r#"
            SELECT
                u.id AS user_id,
                CONCAT(u.firstname, ' ', u.lastname) AS name,
                r.shortname AS role,
                c.id AS course_id,
                c.fullname AS course_name,
                FROM_UNIXTIME(l.timecreated) AS access_time
              FROM mdl_user u
              JOIN mdl_role_assignments ra ON ra.userid = u.id
              JOIN mdl_context ctx ON ctx.id = ra.contextid AND ctx.contextlevel = 50
              JOIN mdl_course c ON c.id = ctx.instanceid
              JOIN mdl_role r ON r.id = ra.roleid
              JOIN mdl_logstore_standard_log l
                ON l.userid = u.id AND l.courseid = c.id
               AND l.action = 'viewed' AND l.target = 'course'
             WHERE u.deleted = 0
            "#
        }
    }
}

/// Converts a MySQL row into a column-keyed map without interpreting it.
pub fn row_to_raw(row: &MySqlRow) -> RawRow {
    let mut raw = RawRow::new();
    for column in row.columns() {
        raw.insert(column.name(), decode_column(row, column.ordinal()));
    }
    raw
}

fn decode_column(row: &MySqlRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(index) {
        return v
            .map(|dt| Value::String(format_local_datetime(dt)))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}
