//! The HTTP/JSON API for stores and operators.
//!
//! Resource-oriented endpoints for store registration and heartbeats,
//! transaction uploads, mining jobs and federated rounds. Handlers never
//! block on mining or aggregation work: they enqueue and return. Every
//! failure response carries `{error, message, timestamp}` with a stable
//! machine-readable code.

use std::{convert::Infallible, net::SocketAddr};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::{http::StatusCode, Filter};

use upfed_core::Transaction;

use crate::{
    sessions::{SessionError, SessionRegistry},
    settings::ApiSettings,
    state_machine::requests::{RequestError, RequestSender, StartRound},
    storage::{with_retry, MiningJob, MiningParams, Storage},
    workers::{EnqueueError, JobSender},
};

/// An error that prevents the API server from starting.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("failed to bind the API server: {0}")]
    Bind(warp::Error),
}

/// Starts the HTTP server at the configured address.
pub async fn serve<T>(
    api_settings: ApiSettings,
    storage: T,
    sessions: SessionRegistry<T>,
    jobs: JobSender,
    rounds: RequestSender,
) -> Result<(), RestError>
where
    T: Storage,
{
    let filter = routes(storage, sessions, jobs, rounds)
        .recover(handle_reject)
        .with(warp::log("http"));
    let (addr, server) = warp::serve(filter)
        .try_bind_ephemeral(api_settings.bind_address)
        .map_err(RestError::Bind)?;
    info!("REST API listening on {}", addr);
    server.await;
    Ok(())
}

/// The full route set, without the rejection handler (tests attach their
/// own).
pub fn routes<T>(
    storage: T,
    sessions: SessionRegistry<T>,
    jobs: JobSender,
    rounds: RequestSender,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone
where
    T: Storage,
{
    let register = warp::path!("api" / "stores" / "register")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::addr::remote())
        .and(with_sessions(sessions.clone()))
        .and_then(handle_register);

    let heartbeat = warp::path!("api" / "stores" / String / "heartbeat")
        .and(warp::post())
        .and(warp::addr::remote())
        .and(with_sessions(sessions.clone()))
        .and_then(handle_heartbeat);

    let stores = warp::path!("api" / "stores")
        .and(warp::get())
        .and(with_sessions(sessions))
        .and_then(handle_stores);

    let upload = warp::path!("api" / "transactions" / "upload" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_storage(storage.clone()))
        .and_then(handle_upload);

    let transactions = warp::path!("api" / "transactions" / String)
        .and(warp::get())
        .and(warp::query::<TransactionsQuery>())
        .and(with_storage(storage.clone()))
        .and_then(handle_transactions);

    let mining_start = warp::path!("api" / "mining" / "start")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_storage(storage.clone()))
        .and(with_jobs(jobs))
        .and_then(handle_mining_start);

    let mining_status = warp::path!("api" / "mining" / "status" / Uuid)
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(handle_mining_status);

    let mining_results = warp::path!("api" / "mining" / "results" / Uuid)
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(handle_mining_results);

    let start_round = warp::path!("api" / "federated" / "start-round")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_rounds(rounds))
        .and_then(handle_start_round);

    let rounds_list = warp::path!("api" / "federated" / "rounds")
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(handle_rounds);

    let round_patterns = warp::path!("api" / "federated" / "rounds" / Uuid / "patterns")
        .and(warp::get())
        .and(with_storage(storage))
        .and_then(handle_round_patterns);

    register
        .or(heartbeat)
        .or(stores)
        .or(upload)
        .or(transactions)
        .or(mining_start)
        .or(mining_status)
        .or(mining_results)
        .or(start_round)
        .or(rounds_list)
        .or(round_patterns)
}

// ///////// Request bodies

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    store_id: String,
    store_name: String,
}

#[derive(Debug, Deserialize)]
struct TransactionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UploadTransaction {
    items: Vec<u32>,
    quantities: Vec<f64>,
    unit_utilities: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct MiningStartRequest {
    store_id: String,
    min_utility: f64,
    min_support: Option<u64>,
    max_pattern_length: Option<usize>,
    use_pruning: Option<bool>,
    batch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct StartRoundRequest {
    min_clients: Option<usize>,
    privacy_budget: Option<f64>,
}

// ///////// Handlers

async fn handle_register<T: Storage>(
    body: RegisterRequest,
    remote: Option<SocketAddr>,
    sessions: SessionRegistry<T>,
) -> Result<impl warp::Reply, warp::Rejection> {
    if body.store_id.trim().is_empty() {
        return Err(validation("store_id", "must not be empty"));
    }
    if body.store_name.trim().is_empty() {
        return Err(validation("store_name", "must not be empty"));
    }
    let record = sessions
        .register(&body.store_id, &body.store_name, remote.map(|a| a.ip().to_string()))
        .await
        .map_err(session_error)?;
    Ok(warp::reply::json(&json!({
        "status": "active",
        "store_id": record.id,
        "store_name": record.name,
        "timestamp": Utc::now(),
    })))
}

async fn handle_heartbeat<T: Storage>(
    store_id: String,
    remote: Option<SocketAddr>,
    sessions: SessionRegistry<T>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let ip = remote
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let seen = sessions
        .heartbeat(&store_id, &ip)
        .await
        .map_err(session_error)?;
    Ok(warp::reply::json(&json!({
        "status": "active",
        "timestamp": seen,
    })))
}

async fn handle_stores<T: Storage>(
    sessions: SessionRegistry<T>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let stores = sessions.stores().await.map_err(session_error)?;
    Ok(warp::reply::json(&json!({
        "stores": stores,
        "timestamp": Utc::now(),
    })))
}

async fn handle_upload<T: Storage>(
    store_id: String,
    body: Vec<UploadTransaction>,
    storage: T,
) -> Result<impl warp::Reply, warp::Rejection> {
    if body.is_empty() {
        return Err(validation("transactions", "at least one transaction is required"));
    }
    if storage
        .store_record(&store_id)
        .await
        .map_err(storage_error)?
        .is_none()
    {
        return Err(warp::reject::custom(ApiError::UnknownStore(store_id)));
    }

    let mut transactions = Vec::with_capacity(body.len());
    for upload in body {
        transactions.push(validate_upload(upload)?);
    }

    let count = with_retry(|| storage.add_transactions(&store_id, transactions.clone(), Utc::now()))
        .await
        .map_err(storage_error)?;
    debug!("stored {} transaction(s) for {}", count, store_id);
    Ok(warp::reply::json(&json!({
        "count": count,
        "timestamp": Utc::now(),
    })))
}

async fn handle_transactions<T: Storage>(
    store_id: String,
    query: TransactionsQuery,
    storage: T,
) -> Result<impl warp::Reply, warp::Rejection> {
    if storage
        .store_record(&store_id)
        .await
        .map_err(storage_error)?
        .is_none()
    {
        return Err(warp::reject::custom(ApiError::UnknownStore(store_id)));
    }
    let rows = storage
        .transactions_page(&store_id, 0, query.limit)
        .await
        .map_err(storage_error)?;
    Ok(warp::reply::json(&json!({
        "count": rows.len(),
        "transactions": rows,
        "timestamp": Utc::now(),
    })))
}

async fn handle_mining_start<T: Storage>(
    body: MiningStartRequest,
    storage: T,
    jobs: JobSender,
) -> Result<impl warp::Reply, warp::Rejection> {
    if !body.min_utility.is_finite() || body.min_utility < 0.0 {
        return Err(validation(
            "min_utility",
            "must be a finite, non-negative number",
        ));
    }
    if body.min_support == Some(0) {
        return Err(validation("min_support", "must be at least 1 when set"));
    }
    if storage
        .store_record(&body.store_id)
        .await
        .map_err(storage_error)?
        .is_none()
    {
        return Err(warp::reject::custom(ApiError::UnknownStore(body.store_id)));
    }

    let job = MiningJob::new(
        body.store_id,
        MiningParams {
            min_utility: body.min_utility,
            min_support: body.min_support,
            max_pattern_length: body.max_pattern_length,
            use_pruning: body.use_pruning.unwrap_or(true),
            batch_size: body.batch_size,
        },
        Utc::now(),
    );
    let job_id = job.id;
    storage.create_job(job).await.map_err(storage_error)?;

    if let Err(err) = jobs.enqueue(job_id) {
        // The job row exists but nobody will pick it up: take it back.
        warn!("failed to enqueue job {}: {}", job_id, err);
        let _ = storage.cancel_job(job_id, Utc::now()).await;
        return Err(warp::reject::custom(match err {
            EnqueueError::QueueFull => ApiError::QueueFull,
            EnqueueError::Closed => ApiError::Internal("the worker pool has shut down"),
        }));
    }

    Ok(warp::reply::json(&json!({
        "job_id": job_id,
        "status": "started",
        "timestamp": Utc::now(),
    })))
}

async fn handle_mining_status<T: Storage>(
    job_id: Uuid,
    storage: T,
) -> Result<impl warp::Reply, warp::Rejection> {
    let job = storage
        .job(job_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| warp::reject::custom(ApiError::JobNotFound(job_id)))?;
    Ok(warp::reply::json(&json!({
        "job": job,
        "timestamp": Utc::now(),
    })))
}

async fn handle_mining_results<T: Storage>(
    job_id: Uuid,
    storage: T,
) -> Result<impl warp::Reply, warp::Rejection> {
    if storage
        .job(job_id)
        .await
        .map_err(storage_error)?
        .is_none()
    {
        return Err(warp::reject::custom(ApiError::JobNotFound(job_id)));
    }
    let mut patterns = storage.local_patterns(job_id).await.map_err(storage_error)?;
    patterns.sort_by(|a, b| {
        b.utility
            .partial_cmp(&a.utility)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.items.cmp(&b.items))
    });
    Ok(warp::reply::json(&json!({
        "job_id": job_id,
        "total_patterns": patterns.len(),
        "patterns": patterns,
        "timestamp": Utc::now(),
    })))
}

async fn handle_start_round(
    body: StartRoundRequest,
    rounds: RequestSender,
) -> Result<impl warp::Reply, warp::Rejection> {
    if let Some(budget) = body.privacy_budget {
        if !budget.is_finite() || budget < 0.0 {
            return Err(validation(
                "privacy_budget",
                "must be a finite, non-negative number",
            ));
        }
    }
    if body.min_clients == Some(0) {
        return Err(validation("min_clients", "must be at least 1 when set"));
    }
    let started = rounds
        .start_round(
            StartRound {
                min_clients: body.min_clients,
                privacy_budget: body.privacy_budget,
            },
            tracing::Span::current(),
        )
        .await
        .map_err(|err| {
            warp::reject::custom(match err {
                RequestError::RoundInProgress => ApiError::RoundInProgress,
                RequestError::PrivacyBudgetExhausted => ApiError::PrivacyBudgetExhausted,
                RequestError::InvalidPrivacyBudget => ApiError::Validation {
                    field: "privacy_budget",
                    message: "must be a finite, non-negative number".to_string(),
                },
                RequestError::Storage(err) => ApiError::Storage(err.to_string()),
                RequestError::InternalError(msg) => ApiError::Internal(msg),
            })
        })?;
    Ok(warp::reply::json(&json!({
        "round_id": started.round_id,
        "round_number": started.round_number,
        "status": "started",
        "timestamp": Utc::now(),
    })))
}

async fn handle_rounds<T: Storage>(storage: T) -> Result<impl warp::Reply, warp::Rejection> {
    let rounds = storage.rounds().await.map_err(storage_error)?;
    Ok(warp::reply::json(&json!({
        "rounds": rounds,
        "timestamp": Utc::now(),
    })))
}

async fn handle_round_patterns<T: Storage>(
    round_id: Uuid,
    storage: T,
) -> Result<impl warp::Reply, warp::Rejection> {
    if storage
        .round(round_id)
        .await
        .map_err(storage_error)?
        .is_none()
    {
        return Err(warp::reject::custom(ApiError::RoundNotFound(round_id)));
    }
    let patterns = storage.global_patterns(round_id).await.map_err(storage_error)?;
    Ok(warp::reply::json(&json!({
        "round_id": round_id,
        "patterns": patterns,
        "timestamp": Utc::now(),
    })))
}

// ///////// Validation

/// Checks the upload payload invariants: equal-length, non-empty arrays
/// with strictly positive, finite numbers.
fn validate_upload(upload: UploadTransaction) -> Result<Transaction, warp::Rejection> {
    if upload.items.is_empty() {
        return Err(validation("items", "must not be empty"));
    }
    if upload.items.len() != upload.quantities.len()
        || upload.items.len() != upload.unit_utilities.len()
    {
        return Err(validation(
            "quantities",
            "items, quantities and unit_utilities must have equal lengths",
        ));
    }
    if upload
        .quantities
        .iter()
        .any(|q| !q.is_finite() || *q <= 0.0)
    {
        return Err(validation(
            "quantities",
            "must be strictly positive finite numbers",
        ));
    }
    if upload
        .unit_utilities
        .iter()
        .any(|u| !u.is_finite() || *u <= 0.0)
    {
        return Err(validation(
            "unit_utilities",
            "must be strictly positive finite numbers",
        ));
    }
    Transaction::new(upload.items, upload.quantities, upload.unit_utilities)
        .map_err(|err| validation("items", &err.to_string()))
}

// ///////// Error plumbing

#[derive(Debug)]
enum ApiError {
    Validation { field: &'static str, message: String },
    UnknownStore(String),
    JobNotFound(Uuid),
    RoundNotFound(Uuid),
    QueueFull,
    RoundInProgress,
    PrivacyBudgetExhausted,
    Storage(String),
    Internal(&'static str),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::UnknownStore(_)
            | ApiError::JobNotFound(_)
            | ApiError::RoundNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RoundInProgress | ApiError::PrivacyBudgetExhausted => StatusCode::CONFLICT,
            ApiError::Storage(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation_error",
            ApiError::UnknownStore(_) => "unknown_store",
            ApiError::JobNotFound(_) => "job_not_found",
            ApiError::RoundNotFound(_) => "round_not_found",
            ApiError::QueueFull => "mining_queue_full",
            ApiError::RoundInProgress => "round_in_progress",
            ApiError::PrivacyBudgetExhausted => "privacy_budget_exhausted",
            ApiError::Storage(_) => "storage_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Validation { field, message } => format!("{}: {}", field, message),
            ApiError::UnknownStore(id) => format!("unknown store: {}", id),
            ApiError::JobNotFound(id) => format!("no such mining job: {}", id),
            ApiError::RoundNotFound(id) => format!("no such round: {}", id),
            ApiError::QueueFull => "the mining queue is full, retry later".to_string(),
            ApiError::RoundInProgress => "another round is already in progress".to_string(),
            ApiError::PrivacyBudgetExhausted => {
                "the cumulative privacy budget is exhausted".to_string()
            }
            ApiError::Storage(message) => message.clone(),
            ApiError::Internal(message) => message.to_string(),
        }
    }
}

fn validation(field: &'static str, message: &str) -> warp::Rejection {
    warp::reject::custom(ApiError::Validation {
        field,
        message: message.to_string(),
    })
}

fn session_error(err: SessionError) -> warp::Rejection {
    warp::reject::custom(match err {
        SessionError::UnknownStore(id) => ApiError::UnknownStore(id),
        SessionError::Storage(err) => ApiError::Storage(err.to_string()),
    })
}

fn storage_error(err: crate::storage::StorageError) -> warp::Rejection {
    warp::reject::custom(ApiError::Storage(err.to_string()))
}

/// Handles rejections: every failure body is `{error, message,
/// timestamp}`.
pub async fn handle_reject(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let (status, code, message) = if let Some(api_error) = err.find::<ApiError>() {
        (api_error.status(), api_error.code(), api_error.message())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "no such resource".to_string())
    } else if let Some(body_error) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            "invalid_body",
            body_error.to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "method not allowed".to_string(),
        )
    } else {
        warn!("unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal server error".to_string(),
        )
    };
    let body = warp::reply::json(&json!({
        "error": code,
        "message": message,
        "timestamp": Utc::now(),
    }));
    Ok(warp::reply::with_status(body, status))
}

// ///////// Filter plumbing

fn with_storage<T: Storage>(
    storage: T,
) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || storage.clone())
}

fn with_sessions<T: Storage>(
    sessions: SessionRegistry<T>,
) -> impl Filter<Extract = (SessionRegistry<T>,), Error = Infallible> + Clone {
    warp::any().map(move || sessions.clone())
}

fn with_jobs(jobs: JobSender) -> impl Filter<Extract = (JobSender,), Error = Infallible> + Clone {
    warp::any().map(move || jobs.clone())
}

fn with_rounds(
    rounds: RequestSender,
) -> impl Filter<Extract = (RequestSender,), Error = Infallible> + Clone {
    warp::any().map(move || rounds.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    use crate::{
        sessions::SessionRegistry,
        settings::{FederationSettings, MiningSettings, PrivacySettings, SessionSettings},
        state_machine::StateMachineInitializer,
        storage::{MemoryStorage, RoundStatus},
        workers,
    };

    async fn test_api() -> (
        MemoryStorage,
        impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone,
    ) {
        let storage = MemoryStorage::new();
        let sessions = SessionRegistry::new(storage.clone(), &SessionSettings::default());
        let jobs = workers::spawn_pool(storage.clone(), &MiningSettings::default());
        let (machine, rounds, _events) = StateMachineInitializer::new(
            FederationSettings::default(),
            PrivacySettings::default(),
            storage.clone(),
            sessions.clone(),
        )
        .init()
        .await
        .unwrap();
        tokio::spawn(machine.run());
        let filter = routes(storage.clone(), sessions, jobs, rounds).recover(handle_reject);
        (storage, filter)
    }

    async fn body_json(res: warp::http::Response<bytes::Bytes>) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list_stores() {
        let (_storage, api) = test_api().await;

        let res = warp::test::request()
            .method("POST")
            .path("/api/stores/register")
            .json(&json!({"store_id": "s1", "store_name": "north"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["status"], "active");
        assert_eq!(body["store_id"], "s1");

        // Registration is idempotent on the id.
        warp::test::request()
            .method("POST")
            .path("/api/stores/register")
            .json(&json!({"store_id": "s1", "store_name": "renamed"}))
            .reply(&api)
            .await;

        let res = warp::test::request().path("/api/stores").reply(&api).await;
        let body = body_json(res).await;
        assert_eq!(body["stores"].as_array().unwrap().len(), 1);
        assert_eq!(body["stores"][0]["name"], "renamed");
        assert_eq!(body["stores"][0]["connection_status"], "active");
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_store_is_a_stable_error() {
        let (_storage, api) = test_api().await;
        let res = warp::test::request()
            .method("POST")
            .path("/api/stores/ghost/heartbeat")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = body_json(res).await;
        assert_eq!(body["error"], "unknown_store");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_upload_validates_payload_shape() {
        let (_storage, api) = test_api().await;
        warp::test::request()
            .method("POST")
            .path("/api/stores/register")
            .json(&json!({"store_id": "s1", "store_name": "north"}))
            .reply(&api)
            .await;

        // Negative quantity.
        let res = warp::test::request()
            .method("POST")
            .path("/api/transactions/upload/s1")
            .json(&json!([{"items": [1], "quantities": [-1.0], "unit_utilities": [2.0]}]))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert_eq!(body["error"], "validation_error");
        assert!(body["message"].as_str().unwrap().contains("quantities"));

        // Mismatched lengths.
        let res = warp::test::request()
            .method("POST")
            .path("/api/transactions/upload/s1")
            .json(&json!([{"items": [1, 2], "quantities": [1.0], "unit_utilities": [2.0, 1.0]}]))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        // Unknown store.
        let res = warp::test::request()
            .method("POST")
            .path("/api/transactions/upload/ghost")
            .json(&json!([{"items": [1], "quantities": [1.0], "unit_utilities": [2.0]}]))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_and_list_transactions() {
        let (_storage, api) = test_api().await;
        warp::test::request()
            .method("POST")
            .path("/api/stores/register")
            .json(&json!({"store_id": "s1", "store_name": "north"}))
            .reply(&api)
            .await;

        let res = warp::test::request()
            .method("POST")
            .path("/api/transactions/upload/s1")
            .json(&json!([
                {"items": [1, 2, 3], "quantities": [2.0, 1.0, 3.0], "unit_utilities": [3.0, 10.0, 1.0]},
                {"items": [1, 3], "quantities": [1.0, 2.0], "unit_utilities": [3.0, 1.0]},
            ]))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["count"], 2);

        let res = warp::test::request()
            .path("/api/transactions/s1?limit=1")
            .reply(&api)
            .await;
        let body = body_json(res).await;
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_mining_job_end_to_end() {
        let (_storage, api) = test_api().await;
        warp::test::request()
            .method("POST")
            .path("/api/stores/register")
            .json(&json!({"store_id": "s1", "store_name": "north"}))
            .reply(&api)
            .await;
        warp::test::request()
            .method("POST")
            .path("/api/transactions/upload/s1")
            .json(&json!([
                {"items": [1, 2, 3], "quantities": [2.0, 1.0, 3.0], "unit_utilities": [3.0, 10.0, 1.0]},
                {"items": [1, 3], "quantities": [1.0, 2.0], "unit_utilities": [3.0, 1.0]},
                {"items": [2, 3], "quantities": [2.0, 4.0], "unit_utilities": [10.0, 1.0]},
            ]))
            .reply(&api)
            .await;

        let res = warp::test::request()
            .method("POST")
            .path("/api/mining/start")
            .json(&json!({"store_id": "s1", "min_utility": 20.0}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["status"], "started");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        // Poll the status endpoint until the worker is done.
        let mut status = String::new();
        for _ in 0..100 {
            let res = warp::test::request()
                .path(&format!("/api/mining/status/{}", job_id))
                .reply(&api)
                .await;
            status = body_json(res).await["job"]["status"]
                .as_str()
                .unwrap()
                .to_string();
            if status == "completed" || status == "failed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, "completed");

        let res = warp::test::request()
            .path(&format!("/api/mining/results/{}", job_id))
            .reply(&api)
            .await;
        let body = body_json(res).await;
        assert_eq!(body["total_patterns"], 2);
        // Sorted by utility descending: {2,3} = 37 first.
        assert_eq!(body["patterns"][0]["items"], json!([2, 3]));
        assert_eq!(body["patterns"][0]["utility"], 37.0);
    }

    #[tokio::test]
    async fn test_unknown_job_endpoints() {
        let (_storage, api) = test_api().await;
        let missing = Uuid::new_v4();
        let res = warp::test::request()
            .path(&format!("/api/mining/status/{}", missing))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(res).await["error"], "job_not_found");

        let res = warp::test::request()
            .path(&format!("/api/mining/results/{}", missing))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_mining_parameters() {
        let (_storage, api) = test_api().await;
        let res = warp::test::request()
            .method("POST")
            .path("/api/mining/start")
            .json(&json!({"store_id": "s1", "min_utility": -3.0}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert!(body["message"].as_str().unwrap().contains("min_utility"));
    }

    #[tokio::test]
    async fn test_federated_round_over_http() {
        let (storage, api) = test_api().await;
        for store in &["s1", "s2"] {
            warp::test::request()
                .method("POST")
                .path("/api/stores/register")
                .json(&json!({"store_id": store, "store_name": store}))
                .reply(&api)
                .await;
            warp::test::request()
                .method("POST")
                .path(&format!("/api/transactions/upload/{}", store))
                .json(&json!([
                    {"items": [1, 2, 3], "quantities": [2.0, 1.0, 3.0], "unit_utilities": [3.0, 10.0, 1.0]},
                    {"items": [2, 3], "quantities": [2.0, 4.0], "unit_utilities": [10.0, 1.0]},
                ]))
                .reply(&api)
                .await;
            let res = warp::test::request()
                .method("POST")
                .path("/api/mining/start")
                .json(&json!({"store_id": store, "min_utility": 20.0}))
                .reply(&api)
                .await;
            let job_id = body_json(res).await["job_id"].as_str().unwrap().to_string();
            for _ in 0..100 {
                let res = warp::test::request()
                    .path(&format!("/api/mining/status/{}", job_id))
                    .reply(&api)
                    .await;
                if body_json(res).await["job"]["status"] == "completed" {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        let res = warp::test::request()
            .method("POST")
            .path("/api/federated/start-round")
            .json(&json!({"min_clients": 2, "privacy_budget": 0.0}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["round_number"], 1);
        let round_id = body["round_id"].as_str().unwrap().to_string();

        // Wait for the coordinator to commit the round.
        for _ in 0..100 {
            let round = storage
                .round(round_id.parse().unwrap())
                .await
                .unwrap()
                .unwrap();
            if round.status == RoundStatus::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let res = warp::test::request()
            .path("/api/federated/rounds")
            .reply(&api)
            .await;
        let body = body_json(res).await;
        assert_eq!(body["rounds"][0]["status"], "completed");
        assert_eq!(body["rounds"][0]["participating_clients"], 2);

        let res = warp::test::request()
            .path(&format!("/api/federated/rounds/{}/patterns", round_id))
            .reply(&api)
            .await;
        let body = body_json(res).await;
        // Both stores mined {2}: 30 and {2,3}: 37 on identical data.
        let patterns = body["patterns"].as_array().unwrap();
        assert_eq!(patterns.len(), 2);

        let missing = Uuid::new_v4();
        let res = warp::test::request()
            .path(&format!("/api/federated/rounds/{}/patterns", missing))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
