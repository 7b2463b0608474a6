//! HTTP API.
//!
//! Every tenant route resolves the tenant's store and brings its schema up
//! to date before doing anything else; `/shared/...` routes do the same for
//! the shared knowledge base.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/tenants/{tenant}/init` | Provision and migrate a tenant store |
//! | `POST` | `/tenants/{tenant}/documents` | Embed and index a document |
//! | `DELETE` | `/tenants/{tenant}/documents/{doc_id}` | Delete a document and its vectors |
//! | `POST` | `/tenants/{tenant}/reindex` | Rebuild a vector table from the store |
//! | `POST` | `/tenants/{tenant}/search` | Similarity search |
//! | `GET`  | `/tenants/{tenant}/tables/{table}` | Row counts and schema of a vector table |
//! | `POST` | `/tenants/{tenant}/conversations` | Save a conversation |
//! | `GET`  | `/tenants/{tenant}/conversations` | Recent conversations (`?limit=`, default 3) |
//! | `GET`  | `/tenants/{tenant}/conversations/last` | Most recent conversation |
//! | `GET`  | `/tenants/{tenant}/personas` | All personas |
//! | `GET`/`PUT`/`DELETE` | `/tenants/{tenant}/personas/{name}` | One persona |
//! | `GET`/`POST` | `/tenants/{tenant}/activities` | Open activities (`?since=`) / upsert |
//! | `PATCH`/`DELETE` | `/tenants/{tenant}/activities/{id}` | Update / delete an activity |
//! | `POST` | `/tenants/{tenant}/activities/{id}/finish` | Finish an activity |
//!
//! `/shared/init`, `/shared/documents`, `/shared/documents/{doc_id}`,
//! `/shared/reindex`, `/shared/search` and `/shared/tables/{table}` mirror the
//! tenant routes.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "schema_mismatch", "message": "schema mismatch on table 'kb': ..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_tenant`, `bad_request` | 400 |
//! | `not_found` | 404 |
//! | `schema_mismatch` | 409 |
//! | `embedding_request_failed` | 502 |
//! | `storage_unavailable` | 503 |
//! | anything else | 500 |

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tenant_vault_core::models::Scope;

use crate::activities::{self, Activity, ActivityPatch, UpsertActivity};
use crate::config::Config;
use crate::conversations::{self, Conversation, SaveConversation, Saved};
use crate::db::TenantConnection;
use crate::documents::{
    self, DeleteReport, IndexReport, IndexRequest, ReindexReport, SearchRequest, TableStats,
};
use crate::error::VaultError;
use crate::migrate::MigrationReport;
use crate::personas;
use crate::vault::Vault;
use crate::vector::SearchHit;

type AppState = Arc<Vault>;
type ApiResult<T> = Result<Json<T>, AppError>;

/// Starts the HTTP server on `[server].bind` and runs until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let vault = Arc::new(Vault::from_config(config)?);
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, root = %config.storage.root.display(), "server listening");
    println!("tvault listening on http://{}", bind_addr);

    axum::serve(listener, router(vault)).await?;
    Ok(())
}

/// All routes over one shared [`Vault`].
pub fn router(vault: Arc<Vault>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tenants/{tenant}/init", post(init_tenant))
        .route("/tenants/{tenant}/documents", post(index_tenant))
        .route("/tenants/{tenant}/documents/{doc_id}", delete(delete_tenant_doc))
        .route("/tenants/{tenant}/reindex", post(reindex_tenant))
        .route("/tenants/{tenant}/search", post(search_tenant))
        .route("/tenants/{tenant}/tables/{table}", get(tenant_table_stats))
        .route(
            "/tenants/{tenant}/conversations",
            post(save_conversation).get(recent_conversations),
        )
        .route("/tenants/{tenant}/conversations/last", get(last_conversation))
        .route("/tenants/{tenant}/personas", get(list_personas))
        .route(
            "/tenants/{tenant}/personas/{name}",
            get(get_persona).put(put_persona).delete(delete_persona),
        )
        .route(
            "/tenants/{tenant}/activities",
            get(open_activities).post(upsert_activity),
        )
        .route(
            "/tenants/{tenant}/activities/{id}",
            delete(delete_activity).patch(update_activity),
        )
        .route("/tenants/{tenant}/activities/{id}/finish", post(finish_activity))
        .route("/shared/init", post(init_shared))
        .route("/shared/documents", post(index_shared))
        .route("/shared/documents/{doc_id}", delete(delete_shared_doc))
        .route("/shared/reindex", post(reindex_shared))
        .route("/shared/search", post(search_shared))
        .route("/shared/tables/{table}", get(shared_table_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(vault)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        let status = match &err {
            VaultError::InvalidTenant(_) | VaultError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            VaultError::NotFound(_) => StatusCode::NOT_FOUND,
            VaultError::SchemaMismatch { .. } => StatusCode::CONFLICT,
            VaultError::EmbeddingRequestFailed { .. } => StatusCode::BAD_GATEWAY,
            VaultError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.kind(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

fn tenant_scope(tenant: &str) -> Result<Scope, AppError> {
    Ok(Scope::tenant(tenant).map_err(VaultError::from)?)
}

/// Resolve, migrate and connect; every record route starts here.
async fn open_tenant(vault: &Vault, tenant: &str) -> Result<TenantConnection, AppError> {
    let scope = tenant_scope(tenant)?;
    let (conn, _) = vault.registry().open(&scope).await?;
    Ok(conn)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Stores and documents ============

async fn init_scope(vault: &Vault, scope: &Scope) -> ApiResult<MigrationReport> {
    let (conn, report) = vault.registry().open(scope).await?;
    conn.close().await?;
    Ok(Json(report))
}

async fn init_tenant(State(vault): State<AppState>, Path(tenant): Path<String>) -> ApiResult<MigrationReport> {
    init_scope(&vault, &tenant_scope(&tenant)?).await
}

async fn init_shared(State(vault): State<AppState>) -> ApiResult<MigrationReport> {
    init_scope(&vault, &Scope::Shared).await
}

async fn index_tenant(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
    Json(request): Json<IndexRequest>,
) -> ApiResult<IndexReport> {
    let scope = tenant_scope(&tenant)?;
    Ok(Json(documents::index_document(&vault, &scope, request).await?))
}

async fn index_shared(
    State(vault): State<AppState>,
    Json(request): Json<IndexRequest>,
) -> ApiResult<IndexReport> {
    Ok(Json(documents::index_document(&vault, &Scope::Shared, request).await?))
}

async fn delete_tenant_doc(
    State(vault): State<AppState>,
    Path((tenant, doc_id)): Path<(String, String)>,
) -> ApiResult<DeleteReport> {
    let scope = tenant_scope(&tenant)?;
    Ok(Json(documents::delete_document(&vault, &scope, &doc_id).await?))
}

async fn delete_shared_doc(
    State(vault): State<AppState>,
    Path(doc_id): Path<String>,
) -> ApiResult<DeleteReport> {
    Ok(Json(documents::delete_document(&vault, &Scope::Shared, &doc_id).await?))
}

#[derive(Deserialize)]
struct ReindexBody {
    table: String,
}

async fn reindex_tenant(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
    Json(body): Json<ReindexBody>,
) -> ApiResult<ReindexReport> {
    let scope = tenant_scope(&tenant)?;
    Ok(Json(documents::reindex(&vault, &scope, &body.table).await?))
}

async fn reindex_shared(
    State(vault): State<AppState>,
    Json(body): Json<ReindexBody>,
) -> ApiResult<ReindexReport> {
    Ok(Json(documents::reindex(&vault, &Scope::Shared, &body.table).await?))
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn search_scope(vault: &Vault, scope: &Scope, request: &SearchRequest) -> ApiResult<SearchResponse> {
    let results = documents::search(vault, scope, request).await?;
    Ok(Json(SearchResponse { results }))
}

async fn search_tenant(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    search_scope(&vault, &tenant_scope(&tenant)?, &request).await
}

async fn search_shared(
    State(vault): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    search_scope(&vault, &Scope::Shared, &request).await
}

async fn tenant_table_stats(
    State(vault): State<AppState>,
    Path((tenant, table)): Path<(String, String)>,
) -> ApiResult<TableStats> {
    let scope = tenant_scope(&tenant)?;
    Ok(Json(documents::table_stats(&vault, &scope, &table).await?))
}

async fn shared_table_stats(
    State(vault): State<AppState>,
    Path(table): Path<String>,
) -> ApiResult<TableStats> {
    Ok(Json(documents::table_stats(&vault, &Scope::Shared, &table).await?))
}

// ============ Conversations ============

#[derive(Serialize)]
struct SavedResponse {
    status: Saved,
}

async fn save_conversation(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
    Json(input): Json<SaveConversation>,
) -> ApiResult<SavedResponse> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    let status = conversations::save(conn.ready().await?, &tenant, &input).await?;
    conn.close().await?;
    Ok(Json(SavedResponse { status }))
}

#[derive(Deserialize)]
struct RecentQuery {
    #[serde(default = "default_recent")]
    limit: u32,
}

fn default_recent() -> u32 {
    3
}

async fn recent_conversations(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
    Query(q): Query<RecentQuery>,
) -> ApiResult<Vec<Conversation>> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    let list = conversations::recent(conn.ready().await?, q.limit).await?;
    conn.close().await?;
    Ok(Json(list))
}

async fn last_conversation(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Conversation> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    let last = conversations::last(conn.ready().await?).await?;
    conn.close().await?;
    last.map(Json)
        .ok_or_else(|| VaultError::NotFound("conversation".into()).into())
}

// ============ Personas ============

async fn list_personas(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<BTreeMap<String, serde_json::Value>> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    let all = personas::list(conn.ready().await?).await?;
    conn.close().await?;
    Ok(Json(all))
}

async fn get_persona(
    State(vault): State<AppState>,
    Path((tenant, name)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    let data = personas::get(conn.ready().await?, &name).await?;
    conn.close().await?;
    Ok(Json(data))
}

async fn put_persona(
    State(vault): State<AppState>,
    Path((tenant, name)): Path<(String, String)>,
    Json(data): Json<serde_json::Value>,
) -> Result<StatusCode, AppError> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    personas::upsert(conn.ready().await?, &name, &data).await?;
    conn.close().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_persona(
    State(vault): State<AppState>,
    Path((tenant, name)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    personas::delete(conn.ready().await?, &name).await?;
    conn.close().await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Activities ============

#[derive(Deserialize)]
struct SinceQuery {
    since: Option<DateTime<Utc>>,
}

async fn open_activities(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
    Query(q): Query<SinceQuery>,
) -> ApiResult<Vec<Activity>> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    let list = activities::open(conn.ready().await?, &tenant, q.since).await?;
    conn.close().await?;
    Ok(Json(list))
}

#[derive(Serialize)]
struct ActivityId {
    activity_id: i64,
}

async fn upsert_activity(
    State(vault): State<AppState>,
    Path(tenant): Path<String>,
    Json(input): Json<UpsertActivity>,
) -> ApiResult<ActivityId> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    let activity_id = activities::upsert(conn.ready().await?, &tenant, &input).await?;
    conn.close().await?;
    Ok(Json(ActivityId { activity_id }))
}

async fn update_activity(
    State(vault): State<AppState>,
    Path((tenant, id)): Path<(String, i64)>,
    Json(patch): Json<ActivityPatch>,
) -> Result<StatusCode, AppError> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    activities::update(conn.ready().await?, id, &patch).await?;
    conn.close().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn finish_activity(
    State(vault): State<AppState>,
    Path((tenant, id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    activities::finish(conn.ready().await?, id).await?;
    conn.close().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_activity(
    State(vault): State<AppState>,
    Path((tenant, id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    let mut conn = open_tenant(&vault, &tenant).await?;
    activities::delete(conn.ready().await?, id).await?;
    conn.close().await?;
    Ok(StatusCode::NO_CONTENT)
}
