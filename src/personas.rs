//! Agent personas of a tenant (`agent_personas`): named JSON documents.

use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use std::collections::BTreeMap;

use crate::error::{VaultError, VaultResult};

pub async fn upsert(conn: &mut SqliteConnection, name: &str, data: &Value) -> VaultResult<()> {
    if name.is_empty() {
        return Err(VaultError::InvalidInput("persona_name is required".into()));
    }
    sqlx::query(
        "INSERT INTO agent_personas (persona_name, persona_data) VALUES (?, ?)
         ON CONFLICT(persona_name) DO UPDATE SET persona_data = excluded.persona_data",
    )
    .bind(name)
    .bind(data.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, name: &str) -> VaultResult<Value> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT persona_data FROM agent_personas WHERE persona_name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    let raw = raw.ok_or_else(|| VaultError::NotFound(format!("persona '{}'", name)))?;
    parse(name, &raw)
}

/// Every persona, keyed by name.
pub async fn list(conn: &mut SqliteConnection) -> VaultResult<BTreeMap<String, Value>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT persona_name, persona_data FROM agent_personas")
            .fetch_all(&mut *conn)
            .await?;
    rows.into_iter()
        .map(|(name, raw)| parse(&name, &raw).map(|v| (name, v)))
        .collect()
}

pub async fn delete(conn: &mut SqliteConnection, name: &str) -> VaultResult<()> {
    let done = sqlx::query("DELETE FROM agent_personas WHERE persona_name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    if done.rows_affected() == 0 {
        return Err(VaultError::NotFound(format!("persona '{}'", name)));
    }
    Ok(())
}

fn parse(name: &str, raw: &str) -> VaultResult<Value> {
    serde_json::from_str(raw)
        .map_err(|e| VaultError::InvalidInput(format!("persona '{}' holds invalid JSON: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TenantRegistry;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tenant_vault_core::models::Scope;

    #[tokio::test]
    async fn test_persona_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let reg = TenantRegistry::new(tmp.path(), Duration::from_secs(5));
        let (mut conn, _) = reg.open(&Scope::tenant("u1").unwrap()).await.unwrap();
        let c = conn.ready().await.unwrap();

        upsert(c, "tutor", &json!({"tone": "calm"})).await.unwrap();
        upsert(c, "tutor", &json!({"tone": "strict"})).await.unwrap();
        upsert(c, "coach", &json!(["a", "b"])).await.unwrap();

        assert_eq!(get(c, "tutor").await.unwrap(), json!({"tone": "strict"}));
        let all = list(c).await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["coach", "tutor"]);

        delete(c, "tutor").await.unwrap();
        assert_eq!(get(c, "tutor").await.unwrap_err().kind(), "not_found");
        assert_eq!(delete(c, "tutor").await.unwrap_err().kind(), "not_found");
    }
}
