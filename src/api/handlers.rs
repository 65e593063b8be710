//! Gateway handlers. Every operation is subject-scoped before data access;
//! cross-subject probes surface as 404, never 403.

use crate::api::idempotency::with_idempotency;
use crate::api::AppState;
use crate::error::AppError;
use crate::models::{Card, CardDescriptors, ExecutionRecord, ExecutionState, Subject};
use crate::objectstore::{key_owned_by, upload_key, PresignedUpload};
use crate::pipeline::ExecutionRequest;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 25;

fn parse_card_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::Validation(format!("malformed card id: {raw}")))
}

fn page_limit(limit: Option<usize>) -> Result<usize, AppError> {
    match limit {
        None => Ok(DEFAULT_PAGE_SIZE),
        Some(n) if (1..=100).contains(&n) => Ok(n),
        Some(n) => Err(AppError::Validation(format!(
            "limit must be within [1,100], got {n}"
        ))),
    }
}

// ---- Health ---------------------------------------------------------------

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ---- Uploads --------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub content_type: String,
    pub file_ext: String,
    pub size_bytes: u64,
}

pub async fn presign_upload(
    State(state): State<AppState>,
    subject: Subject,
    Json(req): Json<PresignRequest>,
) -> Result<Json<PresignedUpload>, AppError> {
    if !state
        .config
        .allowed_mime_types
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&req.content_type))
    {
        return Err(AppError::UnsupportedMediaType(req.content_type));
    }
    if req.size_bytes == 0 {
        return Err(AppError::Validation("sizeBytes must be positive".to_string()));
    }
    if req.size_bytes > state.config.max_upload_bytes {
        return Err(AppError::PayloadTooLarge);
    }

    let ext = req.file_ext.trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 5 || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(AppError::Validation(format!("invalid fileExt: {}", req.file_ext)));
    }

    let key = upload_key(subject.as_str(), &ext);
    let presigned = state
        .objects
        .presign_put(&key, state.config.presign_ttl_seconds)?;
    info!(subject = %subject, key = %presigned.key, "upload presigned");
    Ok(Json(presigned))
}

// ---- Cards ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCardRequest {
    pub front_key: String,
    pub back_key: Option<String>,
    #[serde(default)]
    pub descriptors: Option<CardDescriptors>,
}

pub async fn create_card(
    State(state): State<AppState>,
    subject: Subject,
    headers: HeaderMap,
    Json(req): Json<CreateCardRequest>,
) -> Response {
    let ttl = state.config.idempotency_ttl_seconds;
    with_idempotency(&state.store, &subject, &headers, "createCard", ttl, || async {
        if !key_owned_by(&req.front_key, subject.as_str()) {
            return Err(AppError::Validation("frontKey is not owned by caller".to_string()));
        }
        if let Some(back) = &req.back_key {
            if !key_owned_by(back, subject.as_str()) {
                return Err(AppError::Validation("backKey is not owned by caller".to_string()));
            }
        }
        if state.objects.get(&req.front_key).await?.is_none() {
            return Err(AppError::Validation(format!(
                "frontKey does not exist: {}",
                req.front_key
            )));
        }

        let card = Card::new(
            subject.clone(),
            req.front_key.clone(),
            req.back_key.clone(),
            req.descriptors.clone().unwrap_or_default(),
        );
        state.store.put_card(&card)?;
        info!(subject = %subject, card_id = %card.card_id, "card created");

        Ok((StatusCode::CREATED, serde_json::to_string(&card)?))
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub async fn list_cards(
    State(state): State<AppState>,
    subject: Subject,
    Query(query): Query<ListQuery>,
) -> Result<Json<PageResponse<Card>>, AppError> {
    let limit = page_limit(query.limit)?;
    let (items, next_cursor) = state
        .store
        .list_cards(&subject, limit, query.cursor.as_deref())?;
    Ok(Json(PageResponse { items, next_cursor }))
}

pub async fn get_card(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<String>,
) -> Result<Json<Card>, AppError> {
    let card_id = parse_card_id(&id)?;
    state
        .store
        .get_card(&subject, card_id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("card".to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCardRequest {
    pub name: Option<String>,
    pub set: Option<String>,
    pub number: Option<String>,
    pub rarity: Option<String>,
    #[serde(rename = "type")]
    pub card_type: Option<String>,
    pub condition_estimate: Option<String>,
}

pub async fn update_card(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<UpdateCardRequest>,
) -> Response {
    let ttl = state.config.idempotency_ttl_seconds;
    with_idempotency(&state.store, &subject, &headers, "updateCard", ttl, || async {
        let card_id = parse_card_id(&id)?;
        let mut card = state
            .store
            .get_card(&subject, card_id)?
            .ok_or_else(|| AppError::NotFound("card".to_string()))?;

        let d = &mut card.descriptors;
        if patch.name.is_some() {
            d.name = patch.name.clone();
        }
        if patch.set.is_some() {
            d.set = patch.set.clone();
        }
        if patch.number.is_some() {
            d.number = patch.number.clone();
        }
        if patch.rarity.is_some() {
            d.rarity = patch.rarity.clone();
        }
        if patch.card_type.is_some() {
            d.card_type = patch.card_type.clone();
        }
        if patch.condition_estimate.is_some() {
            d.condition_estimate = patch.condition_estimate.clone();
        }
        card.updated_at = Utc::now();

        state.store.update_card(&card)?;
        Ok((StatusCode::OK, serde_json::to_string(&card)?))
    })
    .await
}

pub async fn delete_card(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let card_id = parse_card_id(&id)?;
    if state.store.delete_card(&subject, card_id)? {
        info!(subject = %subject, card_id = %card_id, "card deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("card".to_string()))
    }
}

// ---- Revaluation ----------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevalueRequest {
    pub window_days: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevalueAccepted {
    pub execution_id: Uuid,
    pub status: String,
}

fn revalue_guard_key(card_id: Uuid) -> String {
    format!("revalue:{card_id}")
}

pub async fn revalue(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<RevalueRequest>>,
) -> Response {
    let ttl = state.config.idempotency_ttl_seconds;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    with_idempotency(&state.store, &subject, &headers, "revalue", ttl, || async {
        let card_id = parse_card_id(&id)?;
        let card = state
            .store
            .get_card(&subject, card_id)?
            .ok_or_else(|| AppError::NotFound("card".to_string()))?;

        let window_days = req
            .window_days
            .unwrap_or(state.config.revalue_window_days)
            .max(1);

        // One in-flight revaluation per card. The guard token is released
        // when the execution settles; its TTL backstops a crashed worker.
        let guard_key = revalue_guard_key(card_id);
        let guard_ttl = (state.config.execution_hard_deadline_ms / 1000) as i64 + 30;
        match state
            .store
            .try_begin_token(&subject, &guard_key, "revalueGuard", guard_ttl)?
        {
            crate::storage::TokenBegin::Created => {}
            _ => return Err(AppError::InProgress),
        }

        let execution_id = Uuid::new_v4();
        let record = ExecutionRecord {
            execution_id,
            card_id,
            subject: subject.clone(),
            state: ExecutionState::Queued,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
        };
        if let Err(e) = state.store.put_execution(&record) {
            let _ = state.store.delete_token(&subject, &guard_key);
            return Err(e);
        }

        let request = ExecutionRequest {
            execution_id,
            card,
            window_days,
        };
        let pipeline = state.pipeline.clone();
        let store = state.store.clone();
        let cancel = state.shutdown.clone();
        let guard_subject = subject.clone();
        tokio::spawn(async move {
            pipeline.run(request, cancel).await;
            let _ = store.delete_token(&guard_subject, &guard_key);
        });

        info!(subject = %subject, card_id = %card_id, execution_id = %execution_id, "revaluation queued");
        let accepted = RevalueAccepted {
            execution_id,
            status: "QUEUED".to_string(),
        };
        Ok((StatusCode::ACCEPTED, serde_json::to_string(&accepted)?))
    })
    .await
}

pub async fn get_execution(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, AppError> {
    let execution_id: Uuid = id
        .parse()
        .map_err(|_| AppError::Validation(format!("malformed execution id: {id}")))?;
    state
        .store
        .get_execution(&subject, execution_id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("execution".to_string()))
}

// ---- Snapshots & analytics ------------------------------------------------

pub async fn list_snapshots(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<PageResponse<crate::models::ValuationSnapshot>>, AppError> {
    let card_id = parse_card_id(&id)?;
    if state.store.get_card(&subject, card_id)?.is_none() {
        return Err(AppError::NotFound("card".to_string()));
    }
    let limit = page_limit(query.limit)?;
    let (items, next_cursor) =
        state
            .store
            .list_snapshots(&subject, card_id, limit, query.cursor.as_deref())?;
    Ok(Json(PageResponse { items, next_cursor }))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub set: String,
    pub rarity: String,
    pub limit: Option<usize>,
}

/// Cards of one set/rarity partition ordered by cached median value.
pub async fn analytics_sets(
    State(state): State<AppState>,
    subject: Subject,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<PageResponse<Card>>, AppError> {
    if query.set.trim().is_empty() || query.rarity.trim().is_empty() {
        return Err(AppError::Validation("set and rarity are required".to_string()));
    }
    let limit = page_limit(query.limit)?;
    let items = state
        .store
        .cards_by_set_rarity(&subject, &query.set, &query.rarity, limit)?;
    Ok(Json(PageResponse {
        items,
        next_cursor: None,
    }))
}
