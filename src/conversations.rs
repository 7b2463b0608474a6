//! Conversation log of a tenant (`user_chat_logs`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::FromRow;

use tenant_vault_core::models::from_epoch;

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Deserialize)]
pub struct SaveConversation {
    pub dialog_session_id: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub dialog_text: Option<String>,
    #[serde(default)]
    pub dialog_meta: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub dialog_session_id: String,
    pub doc_id: Option<String>,
    pub dialog_text: Option<String>,
    pub dialog_meta: Option<String>,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

#[derive(FromRow)]
struct ConversationRow {
    dialog_session_id: String,
    doc_id: Option<String>,
    dialog_text: Option<String>,
    dialog_meta: Option<String>,
    create_time: i64,
    last_update_time: i64,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            dialog_session_id: row.dialog_session_id,
            doc_id: row.doc_id,
            dialog_text: row.dialog_text,
            dialog_meta: row.dialog_meta,
            create_time: from_epoch(row.create_time),
            last_update_time: from_epoch(row.last_update_time),
        }
    }
}

/// Whether [`save`] created a new conversation or updated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Saved {
    Created,
    Updated,
}

const COLUMNS: &str =
    "dialog_session_id, doc_id, dialog_text, dialog_meta, create_time, last_update_time";

/// Create the conversation, or update an existing one with the same session
/// id. Text and meta left empty keep their previous values.
pub async fn save(
    conn: &mut SqliteConnection,
    user_id: &str,
    input: &SaveConversation,
) -> VaultResult<Saved> {
    if input.dialog_session_id.is_empty() {
        return Err(VaultError::InvalidInput(
            "dialog_session_id is required".into(),
        ));
    }
    let now = Utc::now().timestamp();

    let updated = sqlx::query(
        "UPDATE user_chat_logs SET
           dialog_text = COALESCE(NULLIF(?, ''), dialog_text),
           dialog_meta = COALESCE(NULLIF(?, ''), dialog_meta),
           last_update_time = ?
         WHERE dialog_session_id = ?",
    )
    .bind(&input.dialog_text)
    .bind(&input.dialog_meta)
    .bind(now)
    .bind(&input.dialog_session_id)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() > 0 {
        return Ok(Saved::Updated);
    }

    sqlx::query(
        "INSERT INTO user_chat_logs (user_id, doc_id, dialog_session_id, dialog_text, dialog_meta, create_time, last_update_time)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&input.doc_id)
    .bind(&input.dialog_session_id)
    .bind(&input.dialog_text)
    .bind(&input.dialog_meta)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(Saved::Created)
}

/// The most recently created conversation.
pub async fn last(conn: &mut SqliteConnection) -> VaultResult<Option<Conversation>> {
    Ok(recent(conn, 1).await?.into_iter().next())
}

/// Up to `limit` conversations, newest first.
pub async fn recent(conn: &mut SqliteConnection, limit: u32) -> VaultResult<Vec<Conversation>> {
    let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
        "SELECT {} FROM user_chat_logs ORDER BY create_time DESC, id DESC LIMIT ?",
        COLUMNS
    ))
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Conversation::from).collect())
}
