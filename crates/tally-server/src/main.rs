mod auth;
mod config;
mod store;

use anyhow::Context;
use auth::{jwt_auth_middleware, AuthUser};
use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    middleware,
    routing::get,
    Json, Router,
};
use clap::Parser;
use config::Settings;
use serde::Deserialize;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use store::Store;
use tally_core::{validate::is_valid_item_id, ProgressMap};
use tally_proto::{ProgressSnapshot, UpsertRequest, WriteAck};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub settings: Arc<Settings>,
}

#[derive(Parser)]
#[command(name = "tally-server", about = "tally progress API server")]
struct Args {
    /// Path to server configuration TOML file
    #[arg(long, default_value = "~/.config/tally/server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = if args.config.starts_with("~/") {
        dirs::home_dir()
            .context("cannot determine home directory")?
            .join(&args.config[2..])
    } else {
        PathBuf::from(args.config)
    };
    let settings = Arc::new(Settings::from_file(&config_path)?);

    let db_path = settings.database_path()?;
    let store = Store::new(&db_path).await?;
    let state = AppState {
        store,
        settings: settings.clone(),
    };

    let app = router(state);
    let addr = SocketAddr::new(
        settings.server.host.parse::<IpAddr>()?,
        settings.server.port,
    );
    println!("tally-server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    // Progress routes require a verified identity
    let progress_router = Router::new()
        .route(
            "/progress",
            get(fetch_handler)
                .post(upsert_handler)
                .put(replace_handler)
                .delete(delete_handler),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    let api_router = Router::new()
        .route("/health", get(health_handler))
        .merge(progress_router);

    Router::new().nest("/api", api_router).with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

async fn fetch_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ProgressSnapshot>, (StatusCode, String)> {
    let user_id = state
        .store
        .get_or_create_user(&user.username, None)
        .await
        .map_err(internal)?;
    let map = state.store.fetch_progress(user_id).await.map_err(internal)?;
    Ok(Json(ProgressSnapshot::from_map(map)))
}

async fn upsert_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<UpsertRequest>,
) -> Result<(StatusCode, Json<WriteAck>), (StatusCode, String)> {
    let item_id = req.item_id.trim();
    if !is_valid_item_id(item_id) {
        return Err((StatusCode::BAD_REQUEST, "invalid itemId".to_string()));
    }
    let user_id = state
        .store
        .get_or_create_user(&user.username, None)
        .await
        .map_err(internal)?;
    let applied = state
        .store
        .upsert_progress(user_id, item_id, req.done, req.note.as_deref(), req.updated_at)
        .await
        .map_err(internal)?;
    if applied {
        Ok((StatusCode::OK, Json(WriteAck::applied_ack())))
    } else {
        // Stale write: tell the client to refetch, without shipping state
        Ok((StatusCode::CONFLICT, Json(WriteAck::stale())))
    }
}

async fn replace_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ProgressSnapshot>,
) -> Result<(StatusCode, Json<WriteAck>), (StatusCode, String)> {
    let user_id = state
        .store
        .get_or_create_user(&user.username, None)
        .await
        .map_err(internal)?;
    // Malformed ids are dropped, not fatal to the rest of the batch
    let entries: ProgressMap = req
        .into_map()
        .into_iter()
        .filter(|(id, _)| is_valid_item_id(id))
        .collect();
    let (applied, total) = state
        .store
        .replace_progress(user_id, &entries)
        .await
        .map_err(internal)?;
    let ack = WriteAck::batch(applied, total);
    let status = if applied < total {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ack)))
}

#[derive(Deserialize)]
struct DeleteParams {
    #[serde(rename = "itemId")]
    item_id: Option<String>,
}

async fn delete_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<WriteAck>, (StatusCode, String)> {
    if let Some(ref id) = params.item_id {
        if !is_valid_item_id(id) {
            return Err((StatusCode::BAD_REQUEST, "invalid itemId".to_string()));
        }
    }
    let user_id = state
        .store
        .get_or_create_user(&user.username, None)
        .await
        .map_err(internal)?;
    state
        .store
        .delete_progress(user_id, params.item_id.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(WriteAck::applied_ack()))
}
