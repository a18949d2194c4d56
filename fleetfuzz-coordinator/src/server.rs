// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The coordinator's HTTP surface. Everything a handler needs hangs off a
//! single `ServerContext`, constructed once at startup and shared with the
//! background tasks; handlers are plain functions over that context, which
//! keeps tests hermetic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use fleetfuzz::config::FuzzerConfig;
use fleetfuzz::corpus::InputCorpus;
use fleetfuzz::id::FuzzerId;
use fleetfuzz::layout::FleetDirs;
use fleetfuzz::state::FuzzerState;
use log::{error, info};
use metrics::gauge;
use tokio::net::TcpListener;

use crate::admin;
use crate::archive::Archiver;
use crate::crashes::archive_new_crashes;
use crate::registry::NodeRegistry;

pub struct ServerContext {
    pub dirs: FleetDirs,
    pub registry: Arc<NodeRegistry>,
    pub archiver: Arc<dyn Archiver>,
    pub fuzzer_config: FuzzerConfig,
    pub target: Bytes,
    pub dict: Bytes,
}

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        // Operator browser endpoints
        .route("/", get(admin::overview))
        .route("/admin", get(admin::overview))
        // Worker endpoints
        .route("/state", post(post_state))
        .route("/queue", get(get_queues))
        .route("/config", get(get_config))
        .route("/target/binary", get(get_target_binary))
        .route("/inputs", get(get_inputs))
        .route("/dict", get(get_dict))
        .with_state(ctx)
}

pub async fn serve(port: u16, ctx: Arc<ServerContext>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;

    info!("coordinator listening addr={addr}");
    axum::serve(listener, router(ctx))
        .await
        .context("coordinator server exited")
}

/// Workers post their full state here on every sync. The handler persists
/// the output, archives any crash it has not seen before, and only then
/// refreshes the node's registry entry, so a node is never visible as
/// alive while its crashes are still volatile.
async fn post_state(
    State(ctx): State<Arc<ServerContext>>,
    Json(state): Json<FuzzerState>,
) -> Result<StatusCode, AppError> {
    info!(
        "received fuzzer state fuzzer_id={} queue_size={} crashes_size={} hangs_size={}",
        state.id,
        state.output.queue.len(),
        state.output.crashes.len(),
        state.output.hangs.len(),
    );
    gauge!("fuzzer.queue_size", "fuzzer_id" => state.id.to_string())
        .set(state.output.queue.len() as f64);

    let fuzzer_dirs = ctx.dirs.fuzzer(&state.id);
    fuzzer_dirs.create_output_dirs().await?;
    fuzzer_dirs.write_output(&state.output).await?;

    archive_new_crashes(&ctx.dirs, ctx.archiver.as_ref()).await?;

    ctx.registry.set_stats(state.id, state.stats).await;

    Ok(StatusCode::OK)
}

/// The union queue: every fuzzer the coordinator has output for, mapped to
/// that fuzzer's current queue.
async fn get_queues(
    State(ctx): State<Arc<ServerContext>>,
) -> Result<Json<HashMap<FuzzerId, InputCorpus>>, AppError> {
    let queues = ctx.dirs.read_queues().await?;
    Ok(Json(queues))
}

async fn get_config(State(ctx): State<Arc<ServerContext>>) -> Json<FuzzerConfig> {
    Json(ctx.fuzzer_config.clone())
}

/// The seed corpus workers bootstrap from.
async fn get_inputs(
    State(ctx): State<Arc<ServerContext>>,
) -> Result<Json<InputCorpus>, AppError> {
    let corpus = ctx.dirs.read_inputs().await?;
    Ok(Json(corpus))
}

async fn get_target_binary(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        ctx.target.clone(),
    )
}

async fn get_dict(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/text")], ctx.dict.clone())
}

/// Handler-level failure: logged, turned into a 5xx, and forgotten. The
/// worker retries on its next sync; the server keeps serving.
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("request failed err={:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("request failed: {:#}", self.0),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}
