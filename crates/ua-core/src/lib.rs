//! Core domain model for the Uni Analytics local store.
//!
//! Every synced entity is described here twice: as the loosely-typed [`RawRow`]
//! an extractor hands over, and as the typed record the loader writes. The
//! conversion between the two is the only place where source data is coerced.

use std::fmt;

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "ua-core";

/// Text layout used for every timestamp stored in the local database.
pub const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Width of both survey availability windows.
pub const AVAILABILITY_WINDOW_DAYS: i64 = 7;

pub fn parse_local_datetime(input: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    let trimmed = input.trim();
    NaiveDateTime::parse_from_str(trimmed, LOCAL_DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
}

pub fn format_local_datetime(value: NaiveDateTime) -> String {
    value.format(LOCAL_DATETIME_FORMAT).to_string()
}

/// The fixed set of entities the sync pipeline refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    ForumPosts,
    Interactions,
    GradeProgress,
    AssessmentItems,
    Enrollments,
    PublishedContent,
    CourseAccessLogs,
}

impl Entity {
    /// Order in which one sync cycle visits the entities.
    pub const SYNC_ORDER: [Entity; 7] = [
        Entity::ForumPosts,
        Entity::Interactions,
        Entity::GradeProgress,
        Entity::AssessmentItems,
        Entity::Enrollments,
        Entity::PublishedContent,
        Entity::CourseAccessLogs,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Entity::ForumPosts => "forum_posts",
            Entity::Interactions => "interactions",
            Entity::GradeProgress => "grade_progress",
            Entity::AssessmentItems => "efolios",
            Entity::Enrollments => "enrollments",
            Entity::PublishedContent => "published_content",
            Entity::CourseAccessLogs => "course_access_logs",
        }
    }

    /// Local table that holds the entity's rows.
    pub fn table(self) -> &'static str {
        match self {
            Entity::ForumPosts => "forum",
            Entity::Interactions => "interacao",
            Entity::GradeProgress => "grade_progress",
            Entity::AssessmentItems => "efolios",
            Entity::Enrollments => "course_data",
            Entity::PublishedContent => "conteudos_disponibilizados",
            Entity::CourseAccessLogs => "course_access_logs",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
    Manager,
    Other,
}

impl Role {
    /// Maps a Moodle role shortname onto the roles the dashboards distinguish.
    pub fn from_shortname(shortname: Option<&str>) -> Self {
        match shortname.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("student") => Role::Student,
            Some("teacher") | Some("editingteacher") => Role::Teacher,
            Some("manager") | Some("coursecreator") => Role::Manager,
            _ => Role::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Manager => "manager",
            Role::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostType {
    Topic,
    Reply,
}

impl PostType {
    pub fn from_parent(parent_post_id: i64) -> Self {
        if parent_post_id == 0 {
            PostType::Topic
        } else {
            PostType::Reply
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostType::Topic => "topic",
            PostType::Reply => "reply",
        }
    }
}

/// Moodle module name. Unknown modules keep their source name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Assign,
    Quiz,
    Page,
    Resource,
    Lesson,
    Url,
    Book,
    Folder,
    Forum,
    Scorm,
    Other(String),
}

impl ModuleType {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "assign" => ModuleType::Assign,
            "quiz" => ModuleType::Quiz,
            "page" => ModuleType::Page,
            "resource" => ModuleType::Resource,
            "lesson" => ModuleType::Lesson,
            "url" => ModuleType::Url,
            "book" => ModuleType::Book,
            "folder" => ModuleType::Folder,
            "forum" => ModuleType::Forum,
            "scorm" => ModuleType::Scorm,
            other => ModuleType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ModuleType::Assign => "assign",
            ModuleType::Quiz => "quiz",
            ModuleType::Page => "page",
            ModuleType::Resource => "resource",
            ModuleType::Lesson => "lesson",
            ModuleType::Url => "url",
            ModuleType::Book => "book",
            ModuleType::Folder => "folder",
            ModuleType::Forum => "forum",
            ModuleType::Scorm => "scorm",
            ModuleType::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoerceError {
    #[error("missing field `{field}`")]
    Missing { field: &'static str },
    #[error("field `{field}` is not a valid {expected}: {value}")]
    Invalid {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl CoerceError {
    fn invalid(field: &'static str, expected: &'static str, value: &Value) -> Self {
        CoerceError::Invalid {
            field,
            expected,
            value: value.to_string(),
        }
    }
}

/// Column-name keyed row exactly as the remote query returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(Map<String, Value>);

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn i64(&self, field: &'static str) -> Result<i64, CoerceError> {
        self.opt_i64(field)?.ok_or(CoerceError::Missing { field })
    }

    pub fn opt_i64(&self, field: &'static str) -> Result<Option<i64>, CoerceError> {
        let Some(value) = self.get(field) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| CoerceError::invalid(field, "integer", value))
    }

    /// Numeric fields arrive as numbers or decimal strings; anything else is rejected.
    pub fn opt_f64(&self, field: &'static str) -> Result<Option<f64>, CoerceError> {
        let Some(value) = self.get(field) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match parsed {
            Some(f) if f.is_finite() => Ok(Some(f)),
            _ => Err(CoerceError::invalid(field, "number", value)),
        }
    }

    pub fn string(&self, field: &'static str) -> Result<String, CoerceError> {
        self.opt_string(field)?.ok_or(CoerceError::Missing { field })
    }

    pub fn opt_string(&self, field: &'static str) -> Result<Option<String>, CoerceError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(CoerceError::invalid(field, "string", other)),
        }
    }

    /// Accepts unix seconds or a `YYYY-MM-DD HH:MM:SS` string.
    pub fn datetime(&self, field: &'static str) -> Result<NaiveDateTime, CoerceError> {
        let value = self.get(field).ok_or(CoerceError::Missing { field })?;
        match value {
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| Local.timestamp_opt(secs, 0).single())
                .map(|dt: DateTime<Local>| dt.naive_local())
                .ok_or_else(|| CoerceError::invalid(field, "unix timestamp", value)),
            Value::String(s) => {
                parse_local_datetime(s).map_err(|_| CoerceError::invalid(field, "datetime", value))
            }
            _ => Err(CoerceError::invalid(field, "datetime", value)),
        }
    }
}

impl From<Map<String, Value>> for RawRow {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for RawRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// A typed local-store record built from one extracted row.
pub trait SyncRecord: Sized {
    const ENTITY: Entity;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError>;
}

/// One (user, course) enrolment as seen by the LMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub user_id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub course_id: i64,
    pub course_name: String,
    pub group_name: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncRecord for EnrollmentRecord {
    const ENTITY: Entity = Entity::Enrollments;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError> {
        Ok(Self {
            user_id: raw.i64("user_id")?,
            email: raw.string("email")?,
            name: raw.string("name")?,
            role: Role::from_shortname(raw.opt_string("role")?.as_deref()),
            course_id: raw.i64("course_id")?,
            course_name: raw.string("course_name")?,
            group_name: raw.opt_string("group_name")?,
            created_at: raw.datetime("time_created")?,
            updated_at: synced_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForumPost {
    pub post_id: i64,
    pub user_id: i64,
    pub role: Role,
    pub course_id: i64,
    pub post_type: PostType,
    pub parent_post_id: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncRecord for ForumPost {
    const ENTITY: Entity = Entity::ForumPosts;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError> {
        let parent_post_id = raw.i64("parent")?;
        Ok(Self {
            post_id: raw.i64("post_id")?,
            user_id: raw.i64("user_id")?,
            role: Role::from_shortname(raw.opt_string("role")?.as_deref()),
            course_id: raw.i64("course_id")?,
            post_type: PostType::from_parent(parent_post_id),
            parent_post_id,
            created_at: raw.datetime("time_created")?,
            updated_at: synced_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: i64,
    pub course_id: i64,
    pub interaction_type: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncRecord for InteractionEvent {
    const ENTITY: Entity = Entity::Interactions;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError> {
        Ok(Self {
            user_id: raw.i64("user_id")?,
            course_id: raw.i64("course_id")?,
            interaction_type: raw.string("interaction_type")?,
            created_at: raw.datetime("time_created")?,
            updated_at: synced_at,
        })
    }
}

/// Completion state joined with the matching grade, if any.
///
/// Keyed loosely by `(course_module_id, user_id)`; a module with several grade
/// items yields several records and they are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeProgressRecord {
    pub course_module_id: i64,
    pub course_id: i64,
    pub module_type: ModuleType,
    pub user_id: i64,
    pub completion_state: Option<i64>,
    pub item_name: Option<String>,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub final_grade: Option<f64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncRecord for GradeProgressRecord {
    const ENTITY: Entity = Entity::GradeProgress;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError> {
        // Moodle uses 2/3 for complete-pass/complete-fail; the store only knows done or not.
        let completion_state = match raw.opt_i64("completion_state")? {
            Some(state) if state < 0 => {
                return Err(CoerceError::Invalid {
                    field: "completion_state",
                    expected: "completion state",
                    value: state.to_string(),
                })
            }
            Some(state) => Some(state.min(1)),
            None => None,
        };
        Ok(Self {
            course_module_id: raw.i64("course_module_id")?,
            course_id: raw.i64("course_id")?,
            module_type: ModuleType::from_name(&raw.string("module_type")?),
            user_id: raw.i64("user_id")?,
            completion_state,
            item_name: raw.opt_string("item_name")?,
            group_id: raw.opt_i64("group_id")?,
            group_name: raw.opt_string("group_name")?,
            final_grade: raw.opt_f64("final_grade")?,
            created_at: raw.datetime("time_created")?,
            updated_at: synced_at,
        })
    }
}

/// An "e-folio": a graded assignment whose dates gate the pre/post surveys.
///
/// `available_pre`/`available_pos` belong to the window validator; a reload
/// starts them cleared and the store carries previously computed values over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentItem {
    pub item_id: i64,
    pub name: String,
    pub course_id: i64,
    pub course_name: String,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub available_pre: bool,
    pub available_pos: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncRecord for AssessmentItem {
    const ENTITY: Entity = Entity::AssessmentItems;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError> {
        Ok(Self {
            item_id: raw.i64("item_id")?,
            name: raw.string("name")?,
            course_id: raw.i64("course_id")?,
            course_name: raw.string("course_name")?,
            start_date: raw.datetime("start_date")?,
            end_date: raw.datetime("end_date")?,
            available_pre: false,
            available_pos: false,
            created_at: raw.datetime("time_created")?,
            updated_at: synced_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub course_module_id: i64,
    pub course_id: i64,
    pub module_type: ModuleType,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncRecord for ContentItem {
    const ENTITY: Entity = Entity::PublishedContent;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError> {
        Ok(Self {
            course_module_id: raw.i64("course_module_id")?,
            course_id: raw.i64("course_id")?,
            module_type: ModuleType::from_name(&raw.string("module_type")?),
            created_at: raw.datetime("time_created")?,
            updated_at: synced_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub user_id: i64,
    pub name: String,
    pub role: Role,
    pub course_id: i64,
    pub course_name: String,
    pub access_time: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncRecord for AccessLogEntry {
    const ENTITY: Entity = Entity::CourseAccessLogs;

    fn from_raw(raw: &RawRow, synced_at: NaiveDateTime) -> Result<Self, CoerceError> {
        Ok(Self {
            user_id: raw.i64("user_id")?,
            name: raw.string("name")?,
            role: Role::from_shortname(raw.opt_string("role")?.as_deref()),
            course_id: raw.i64("course_id")?,
            course_name: raw.string("course_name")?,
            access_time: raw.datetime("access_time")?,
            updated_at: synced_at,
        })
    }
}

/// Survey availability flags for one assessment item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Availability {
    pub pre: bool,
    pub pos: bool,
}

impl Availability {
    /// Pre-survey is open on `[start - 7d, start]`, post-survey on `[end, end + 7d]`,
    /// both bounds inclusive. Each flag depends on its own bound only.
    pub fn evaluate(start: NaiveDateTime, end: NaiveDateTime, now: NaiveDateTime) -> Self {
        let window = Duration::days(AVAILABILITY_WINDOW_DAYS);
        Self {
            pre: start - window <= now && now <= start,
            pos: end <= now && now <= end + window,
        }
    }
}

/// Stored dates of one assessment item, as text, awaiting evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentWindow {
    pub item_id: i64,
    pub start_date: String,
    pub end_date: String,
}

impl AssessmentWindow {
    pub fn bounds(&self) -> Result<(NaiveDateTime, NaiveDateTime), CoerceError> {
        let start = parse_local_datetime(&self.start_date).map_err(|_| CoerceError::Invalid {
            field: "start_date",
            expected: "datetime",
            value: self.start_date.clone(),
        })?;
        let end = parse_local_datetime(&self.end_date).map_err(|_| CoerceError::Invalid {
            field: "end_date",
            expected: "datetime",
            value: self.end_date.clone(),
        })?;
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> NaiveDateTime {
        parse_local_datetime(s).unwrap()
    }

    fn synced() -> NaiveDateTime {
        ts("2024-03-01 12:00:00")
    }

    #[test]
    fn pre_window_boundaries_are_inclusive() {
        let start = ts("2024-03-15 00:00:00");
        let end = ts("2024-03-22 00:00:00");
        assert!(Availability::evaluate(start, end, ts("2024-03-08 00:00:00")).pre);
        assert!(!Availability::evaluate(start, end, ts("2024-03-07 23:59:59")).pre);
        assert!(Availability::evaluate(start, end, ts("2024-03-15 00:00:00")).pre);
        assert!(!Availability::evaluate(start, end, ts("2024-03-15 00:00:01")).pre);
    }

    #[test]
    fn post_window_boundaries_are_inclusive() {
        let start = ts("2024-03-15 00:00:00");
        let end = ts("2024-03-22 00:00:00");
        assert!(Availability::evaluate(start, end, ts("2024-03-22 00:00:00")).pos);
        assert!(!Availability::evaluate(start, end, ts("2024-03-21 23:59:59")).pos);
        assert!(Availability::evaluate(start, end, ts("2024-03-29 00:00:00")).pos);
        assert!(!Availability::evaluate(start, end, ts("2024-03-29 00:00:01")).pos);
    }

    #[test]
    fn inverted_window_flags_follow_their_own_bound() {
        let start = ts("2024-03-22 00:00:00");
        let end = ts("2024-03-15 00:00:00");
        let flags = Availability::evaluate(start, end, ts("2024-03-16 00:00:00"));
        assert_eq!(flags, Availability { pre: true, pos: true });
    }

    #[test]
    fn forum_post_type_is_derived_from_parent() {
        let row = RawRow::new()
            .with("post_id", 7)
            .with("user_id", 3)
            .with("role", "editingteacher")
            .with("course_id", 2)
            .with("parent", 0)
            .with("post_type", "reply")
            .with("time_created", "2024-01-02 03:04:05");
        let post = ForumPost::from_raw(&row, synced()).unwrap();
        assert_eq!(post.post_type, PostType::Topic);
        assert_eq!(post.role, Role::Teacher);

        let reply = ForumPost::from_raw(&row.clone().with("parent", 7), synced()).unwrap();
        assert_eq!(reply.post_type, PostType::Reply);
        assert_eq!(reply.parent_post_id, 7);
    }

    #[test]
    fn grade_coerces_decimal_strings_and_rejects_garbage() {
        let row = RawRow::new()
            .with("course_module_id", 11)
            .with("course_id", 2)
            .with("module_type", "assign")
            .with("user_id", 5)
            .with("completion_state", 2)
            .with("item_name", "e-folio A")
            .with("group_id", Value::Null)
            .with("group_name", Value::Null)
            .with("final_grade", "3.50000")
            .with("time_created", 1_700_000_000);
        let record = GradeProgressRecord::from_raw(&row, synced()).unwrap();
        assert_eq!(record.final_grade, Some(3.5));
        assert_eq!(record.completion_state, Some(1));
        assert_eq!(record.group_id, None);
        assert_eq!(record.module_type, ModuleType::Assign);

        let bad = row.with("final_grade", "n/a");
        let err = GradeProgressRecord::from_raw(&bad, synced()).unwrap_err();
        assert!(matches!(err, CoerceError::Invalid { field: "final_grade", .. }));
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let row = RawRow::new().with("user_id", 1).with("course_id", 2);
        let err = InteractionEvent::from_raw(&row, synced()).unwrap_err();
        assert_eq!(err, CoerceError::Missing { field: "interaction_type" });
    }

    #[test]
    fn unix_timestamps_are_read_as_local_time() {
        let row = RawRow::new().with("time_created", json!(0));
        let expected = Local.timestamp_opt(0, 0).single().unwrap().naive_local();
        assert_eq!(row.datetime("time_created").unwrap(), expected);
    }

    #[test]
    fn role_shortnames_collapse_to_dashboard_roles() {
        assert_eq!(Role::from_shortname(Some("student")), Role::Student);
        assert_eq!(Role::from_shortname(Some("coursecreator")), Role::Manager);
        assert_eq!(Role::from_shortname(Some("none")), Role::Other);
        assert_eq!(Role::from_shortname(None), Role::Other);
    }

    #[test]
    fn unknown_module_keeps_its_name() {
        let module = ModuleType::from_name("H5PActivity");
        assert_eq!(module.as_str(), "h5pactivity");
    }

    #[test]
    fn assessment_window_reports_bad_dates() {
        let window = AssessmentWindow {
            item_id: 1,
            start_date: "not a date".into(),
            end_date: "2024-03-22 00:00:00".into(),
        };
        assert!(matches!(
            window.bounds(),
            Err(CoerceError::Invalid { field: "start_date", .. })
        ));
    }
}
