//! HTTP surface: paged mirror reads, run triggers and identity linking.

use crate::config::Listener;
use crate::errors::{AppError, Result};
use crate::linking::{Capabilities, LinkTarget, LinkingColleague, LinkingError, Support};
use crate::mediator::{ColleagueOperation, Mediator};
use crate::pagination::{LinkBuilder, PageQuery, PagedResponse};
use crate::run_state::{Domain, OperationKind, RunStateRegistry};
use crate::services::DomainServices;
use crate::store::{Record, Store};
use crate::types::{CmdbApplication, CmdbUser, LegacyConnection, OidcClient, SamlConnection};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Sender name the API uses when notifying colleagues.
const API_SENDER: &str = "api";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub run_state: Arc<RunStateRegistry>,
    pub services: DomainServices,
    pub mediator: Arc<Mediator>,
    pub links: LinkBuilder,
    pub max_page_size: u32,
    /// `None` when no identity cloud is configured.
    pub capabilities: Option<Capabilities>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/saml-connections", get(list::<SamlConnection>))
        .route("/api/v1/saml-connections/{id}", get(fetch::<SamlConnection>))
        .route("/api/v1/oidc-clients", get(list::<OidcClient>))
        .route("/api/v1/oidc-clients/{id}", get(fetch::<OidcClient>))
        .route("/api/v1/legacy-connections", get(list::<LegacyConnection>))
        .route("/api/v1/legacy-connections/{id}", get(fetch::<LegacyConnection>))
        .route("/api/v1/cmdb-applications", get(list::<CmdbApplication>))
        .route("/api/v1/cmdb-applications/{id}", get(fetch::<CmdbApplication>))
        .route("/api/v1/cmdb-users", get(list::<CmdbUser>))
        .route("/api/v1/cmdb-users/{id}", get(fetch::<CmdbUser>))
        .route("/api/v1/aggregations/{domain}", post(start_aggregation))
        .route("/api/v1/purges/{domain}", post(start_purge))
        .route(
            "/api/v1/identities/{user_id}/links/{target}",
            put(link).delete(unlink),
        )
        .route("/api/v1/linking/capabilities", get(capabilities))
        .route("/api/v1/run-state", get(run_state))
        .with_state(state)
}

pub async fn serve(
    listener: &Listener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.addr();
    let tcp = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "api listening");
    axum::serve(tcp, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn list<R: Record>(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    query: std::result::Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<PagedResponse<R>>> {
    let Query(query) = query.map_err(|e| AppError::Validation(e.body_text()))?;
    let filter = query.into_filter(state.max_page_size)?;

    let (data, total) = state.store.page_with_count::<R>(&filter).await?;
    let response = PagedResponse::build(data, total, &filter, &state.links, uri.path())?;
    Ok(Json(response))
}

async fn fetch<R: Record>(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<R>> {
    state
        .store
        .get::<R>(&id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound { kind: R::KIND, id })
}

async fn start_aggregation(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Response> {
    start(&state, &domain, OperationKind::Aggregation)
}

async fn start_purge(State(state): State<AppState>, Path(domain): Path<String>) -> Result<Response> {
    start(&state, &domain, OperationKind::Purge)
}

/// Claims the run flag before answering, so a concurrent request sees the
/// conflict; the run itself continues in the background.
fn start(state: &AppState, domain: &str, kind: OperationKind) -> Result<Response> {
    let domain: Domain = domain
        .parse()
        .map_err(|e: crate::run_state::UnknownDomain| AppError::Validation(e.to_string()))?;
    let service = state.services.get(domain)?;
    let guard = service.begin(kind)?;
    let flag = guard.flag();

    tokio::spawn(async move {
        if let Err(e) = service.run(guard).await {
            tracing::error!(%flag, error = %e, "background run failed");
        }
    });

    let body = json!({"accepted": true, "flag": flag.to_string()});
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkBody {
    correlation_id: String,
}

fn parse_target(target: &str) -> Result<LinkTarget> {
    Ok(target.parse::<LinkTarget>()?)
}

async fn link(
    State(state): State<AppState>,
    Path((user_id, target)): Path<(String, String)>,
    body: std::result::Result<Json<LinkBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let target = parse_target(&target)?;
    let Json(body) = body.map_err(|e| AppError::Validation(e.body_text()))?;

    let operation = ColleagueOperation::Link(target);
    let payload = json!({"userId": user_id, "correlationId": body.correlation_id});
    let result = state.mediator.notify(API_SENDER, operation, payload).await?;
    result
        .map(Json)
        .ok_or_else(|| LinkingError::Unsupported(operation).into())
}

async fn unlink(
    State(state): State<AppState>,
    Path((user_id, target)): Path<(String, String)>,
) -> Result<StatusCode> {
    let operation = ColleagueOperation::Unlink(parse_target(&target)?);
    let payload = json!({"userId": user_id});
    match state.mediator.notify(API_SENDER, operation, payload).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(LinkingError::Unsupported(operation).into()),
    }
}

async fn capabilities(State(state): State<AppState>) -> Json<BTreeMap<String, Support>> {
    let map = match &state.capabilities {
        Some(capabilities) => capabilities.as_map().into_iter().collect(),
        None => LinkingColleague::operations()
            .map(|op| (op.to_string(), Support::Unsupported))
            .collect(),
    };
    Json(map)
}

async fn run_state(State(state): State<AppState>) -> Json<BTreeMap<String, bool>> {
    Json(
        state
            .run_state
            .snapshot()
            .into_iter()
            .map(|(flag, running)| (flag.to_string(), running))
            .collect(),
    )
}
