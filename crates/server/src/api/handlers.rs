use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokenflow_core::{
    definition::{DefinitionSummary, ProcessDefinition, ProcessDefinitionSource},
    events::ExecutionEvent,
    DefinitionId, InstanceId, InstanceSnapshot, TokenId, Variables,
};

fn parse_instance_id(raw: &str) -> ApiResult<InstanceId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid instance id {raw}")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DefinitionResponse {
    pub id: DefinitionId,
    pub deployed_at: DateTime<Utc>,
    pub source: ProcessDefinitionSource,
}

impl From<&ProcessDefinition> for DefinitionResponse {
    fn from(def: &ProcessDefinition) -> Self {
        Self {
            id: def.id.clone(),
            deployed_at: def.deployed_at,
            source: def.to_source(),
        }
    }
}

/// Deploy a new version of a definition
pub async fn deploy_definition(
    State(state): State<Arc<AppState>>,
    Json(source): Json<ProcessDefinitionSource>,
) -> ApiResult<(StatusCode, Json<DefinitionResponse>)> {
    let engine = state.service.engine().await?;
    let id = engine.definitions().deploy(source)?;
    let definition = engine.definitions().get(&id)?;
    Ok((StatusCode::CREATED, Json(DefinitionResponse::from(definition.as_ref()))))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListDefinitionsResponse {
    pub definitions: Vec<DefinitionSummary>,
}

pub async fn list_definitions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListDefinitionsResponse>> {
    let engine = state.service.engine().await?;
    let definitions = engine.definitions().list()?;
    Ok(Json(ListDefinitionsResponse { definitions }))
}

/// Latest version of a definition key
pub async fn get_definition(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<DefinitionResponse>> {
    let engine = state.service.engine().await?;
    let definition = engine.definitions().latest(&key)?;
    Ok(Json(DefinitionResponse::from(definition.as_ref())))
}

pub async fn get_definition_version(
    State(state): State<Arc<AppState>>,
    Path((key, version)): Path<(String, u32)>,
) -> ApiResult<Json<DefinitionResponse>> {
    let engine = state.service.engine().await?;
    let definition = engine.definitions().get(&DefinitionId::new(key, version))?;
    Ok(Json(DefinitionResponse::from(definition.as_ref())))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartInstanceRequest {
    pub definition_key: String,
    /// Pinned version; the latest one when absent
    pub version: Option<u32>,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartInstanceResponse {
    pub instance_id: InstanceId,
    pub definition_id: DefinitionId,
}

/// Start a new process instance
pub async fn start_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartInstanceRequest>,
) -> ApiResult<(StatusCode, Json<StartInstanceResponse>)> {
    let engine = state.service.engine().await?;
    let definition_id = match req.version {
        Some(version) => DefinitionId::new(req.definition_key, version),
        None => engine.definitions().latest(&req.definition_key)?.id.clone(),
    };
    let instance_id = engine.start_instance(&definition_id, req.variables).await?;

    Ok((
        StatusCode::CREATED,
        Json(StartInstanceResponse {
            instance_id,
            definition_id,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListInstancesResponse {
    pub instances: Vec<InstanceSnapshot>,
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListInstancesResponse>> {
    let engine = state.service.engine().await?;
    let instances = engine.list_instances().await;
    Ok(Json(ListInstancesResponse { instances }))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstanceSnapshot>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let engine = state.service.engine().await?;
    Ok(Json(engine.get_state(instance_id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetInstanceEventsResponse {
    pub events: Vec<ExecutionEvent>,
}

/// Committed event history of an instance
pub async fn get_instance_events(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<GetInstanceEventsResponse>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let engine = state.service.engine().await?;
    let events = engine.events(instance_id).await?;
    Ok(Json(GetInstanceEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignalRequest {
    pub token_id: TokenId,
    #[serde(default)]
    pub payload: Variables,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignalResponse {
    pub instance_id: InstanceId,
    pub token_id: TokenId,
}

/// Resume a waiting token. Accepted means the resume is durable; the token
/// runs on the next free worker.
pub async fn signal_token(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<SignalRequest>,
) -> ApiResult<(StatusCode, Json<SignalResponse>)> {
    let instance_id = parse_instance_id(&instance_id)?;
    let engine = state.service.engine().await?;
    engine.signal(instance_id, req.token_id, req.payload).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SignalResponse {
            instance_id,
            token_id: req.token_id,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageRequest {
    pub message: String,
    #[serde(default)]
    pub payload: Variables,
}

/// Deliver a named message to the receive task waiting for it
pub async fn deliver_message(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<(StatusCode, Json<SignalResponse>)> {
    let instance_id = parse_instance_id(&instance_id)?;
    let engine = state.service.engine().await?;
    let token_id = engine.signal_message(instance_id, &req.message, req.payload).await?;

    Ok((StatusCode::ACCEPTED, Json(SignalResponse { instance_id, token_id })))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Terminate an instance; the request body is optional
pub async fn terminate_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    req: Option<Json<TerminateRequest>>,
) -> ApiResult<Json<InstanceSnapshot>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let engine = state.service.engine().await?;
    let reason = req
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "terminated via API".to_string());
    engine.terminate(instance_id, reason).await?;
    Ok(Json(engine.get_state(instance_id).await?))
}

pub async fn suspend_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstanceSnapshot>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let engine = state.service.engine().await?;
    engine.suspend(instance_id).await?;
    Ok(Json(engine.get_state(instance_id).await?))
}

pub async fn resume_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstanceSnapshot>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let engine = state.service.engine().await?;
    engine.resume(instance_id).await?;
    Ok(Json(engine.get_state(instance_id).await?))
}
