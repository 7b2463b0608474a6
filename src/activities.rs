//! Activity list of a tenant (`user_activities`).
//!
//! An activity is keyed by `(user_id, session_id)`; it stays on the open
//! list until finished (`check_flag = 1`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::FromRow;

use tenant_vault_core::models::{from_epoch, to_epoch};

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertActivity {
    pub session_id: String,
    #[serde(default)]
    pub activity_desc: Option<String>,
    #[serde(default)]
    pub finish_date: Option<DateTime<Utc>>,
}

/// Fields to change. Absent fields are left as they are; an explicit `null`
/// clears `activity_desc` or `finish_date`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityPatch {
    #[serde(default)]
    pub check_flag: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub activity_desc: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub finish_date: Option<Option<DateTime<Utc>>>,
}

/// `Some(None)` for a `null` value; absent keys fall back to `None`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub activity_id: i64,
    pub session_id: String,
    pub activity_desc: Option<String>,
    pub create_date: DateTime<Utc>,
    pub finish_date: Option<DateTime<Utc>>,
    pub finished: bool,
}

#[derive(FromRow)]
struct ActivityRow {
    activity_id: i64,
    session_id: String,
    activity_desc: Option<String>,
    create_date: i64,
    finish_date: Option<i64>,
    check_flag: i64,
}

impl From<ActivityRow> for Activity {
    fn from(row: ActivityRow) -> Self {
        Self {
            activity_id: row.activity_id,
            session_id: row.session_id,
            activity_desc: row.activity_desc,
            create_date: from_epoch(row.create_date),
            finish_date: row.finish_date.map(from_epoch),
            finished: row.check_flag != 0,
        }
    }
}

/// Create or replace the activity for `(user_id, session_id)`; returns its id.
pub async fn upsert(
    conn: &mut SqliteConnection,
    user_id: &str,
    input: &UpsertActivity,
) -> VaultResult<i64> {
    if input.session_id.is_empty() {
        return Err(VaultError::InvalidInput("session_id is required".into()));
    }
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO user_activities (user_id, session_id, activity_desc, create_date, finish_date)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(user_id, session_id) DO UPDATE SET
           activity_desc = excluded.activity_desc,
           finish_date = excluded.finish_date,
           create_date = excluded.create_date
         RETURNING activity_id",
    )
    .bind(user_id)
    .bind(&input.session_id)
    .bind(&input.activity_desc)
    .bind(Utc::now().timestamp())
    .bind(input.finish_date.map(to_epoch))
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn update(conn: &mut SqliteConnection, activity_id: i64, patch: &ActivityPatch) -> VaultResult<()> {
    let done = sqlx::query(
        "UPDATE user_activities SET
           check_flag = COALESCE(?, check_flag),
           activity_desc = CASE WHEN ? THEN ? ELSE activity_desc END,
           finish_date = CASE WHEN ? THEN ? ELSE finish_date END
         WHERE activity_id = ?",
    )
    .bind(patch.check_flag.map(i64::from))
    .bind(patch.activity_desc.is_some())
    .bind(patch.activity_desc.clone().flatten())
    .bind(patch.finish_date.is_some())
    .bind(patch.finish_date.flatten().map(to_epoch))
    .bind(activity_id)
    .execute(&mut *conn)
    .await?;
    found(done.rows_affected(), activity_id)
}

/// Mark finished now.
pub async fn finish(conn: &mut SqliteConnection, activity_id: i64) -> VaultResult<()> {
    let done = sqlx::query(
        "UPDATE user_activities SET check_flag = 1, finish_date = ? WHERE activity_id = ?",
    )
    .bind(Utc::now().timestamp())
    .bind(activity_id)
    .execute(&mut *conn)
    .await?;
    found(done.rows_affected(), activity_id)
}

pub async fn delete(conn: &mut SqliteConnection, activity_id: i64) -> VaultResult<()> {
    let done = sqlx::query("DELETE FROM user_activities WHERE activity_id = ?")
        .bind(activity_id)
        .execute(&mut *conn)
        .await?;
    found(done.rows_affected(), activity_id)
}

/// Unfinished activities of `user_id`, optionally only those created at or
/// after `since`.
pub async fn open(
    conn: &mut SqliteConnection,
    user_id: &str,
    since: Option<DateTime<Utc>>,
) -> VaultResult<Vec<Activity>> {
    let rows: Vec<ActivityRow> = sqlx::query_as(
        "SELECT activity_id, session_id, activity_desc, create_date, finish_date, check_flag
         FROM user_activities
         WHERE user_id = ? AND check_flag = 0 AND create_date >= ?
         ORDER BY create_date, activity_id",
    )
    .bind(user_id)
    .bind(since.map(to_epoch).unwrap_or(i64::MIN))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Activity::from).collect())
}

fn found(rows: u64, activity_id: i64) -> VaultResult<()> {
    if rows == 0 {
        Err(VaultError::NotFound(format!("activity {}", activity_id)))
    } else {
        Ok(())
    }
}
