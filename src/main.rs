use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use goban::auth::TokenResolver;
use goban::board::GridBoardFactory;
use goban::bot::{run_bot, RandomMover};
use goban::config::ServerConfig;
use goban::errors::MatchError;
use goban::match_state::Color;
use goban::matchmaker::Matchmaker;
use goban::persistence::MemoryGateway;
use goban::presence::{MemoryPresence, PairingEntry, PresenceRecord, PresenceStore};
use goban::registry::MatchRegistry;
use goban::relay::{self, InProcessRelay};
use goban::session::{establish, reattach, ConnectionSession, MatchContext};

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
enum Intent {
    #[default]
    Play,
    Reconnect,
}

#[derive(Debug, Deserialize)]
struct GameQuery {
    token: String,
    #[serde(default)]
    intent: Intent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairingResponse {
    game_id: String,
    color: Color,
    opponent: String,
}

#[derive(Debug, Serialize)]
struct PendingResponse {
    status: &'static str,
}

fn reject(e: MatchError) -> (StatusCode, String) {
    let code = match &e {
        MatchError::NoLiveMatch { .. } | MatchError::MatchNotFound { .. } => StatusCode::NOT_FOUND,
        MatchError::Protocol(_) | MatchError::Rule(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}

async fn hello_world() -> &'static str {
    "goban match server"
}

/// Queue for a match; resolves when an opponent arrives.
async fn find_match(
    State(ctx): State<MatchContext>,
    Query(q): Query<TokenQuery>,
) -> Result<Json<PairingResponse>, (StatusCode, String)> {
    let identity = ctx.auth.resolve(&q.token).await.map_err(reject)?;
    let ticket = ctx.matchmaker.find(identity).await.map_err(reject)?;
    Ok(Json(PairingResponse {
        game_id: ticket.match_id,
        color: ticket.color,
        opponent: ticket.opponent,
    }))
}

/// Open a match against the house bot. The bot runs as a headless
/// second replica of the match; no queueing involved.
async fn bot_match(
    State(ctx): State<MatchContext>,
    Query(q): Query<TokenQuery>,
) -> Result<Json<PairingResponse>, (StatusCode, String)> {
    let identity = ctx.auth.resolve(&q.token).await.map_err(reject)?;
    let match_id = Uuid::new_v4().to_string();
    let bot_identity = format!("bot-{}", &match_id[..8]);

    ctx.presence
        .upsert(PresenceRecord::opening(
            match_id.clone(),
            identity.clone(),
            bot_identity.clone(),
        ))
        .await
        .map_err(reject)?;
    ctx.presence
        .set_pairing(
            identity.clone(),
            PairingEntry {
                match_id: match_id.clone(),
                color: Color::Black,
            },
        )
        .await
        .map_err(reject)?;

    log::info!("match {match_id}: {identity} opened a bot match against {bot_identity}");
    tokio::spawn(run_bot(
        ctx.clone(),
        match_id.clone(),
        bot_identity.clone(),
        identity,
        Box::new(RandomMover),
    ));

    Ok(Json(PairingResponse {
        game_id: match_id,
        color: Color::Black,
        opponent: bot_identity,
    }))
}

/// Does this process hold a live replica for the caller? Clients probe
/// this after an unclean disconnect to decide whether to offer a
/// reconnect.
async fn pending_match(
    State(ctx): State<MatchContext>,
    Query(q): Query<TokenQuery>,
) -> Result<Json<PendingResponse>, (StatusCode, String)> {
    let identity = ctx.auth.resolve(&q.token).await.map_err(reject)?;
    let status = if ctx.registry.contains(&identity).await {
        "present"
    } else {
        "absent"
    };
    Ok(Json(PendingResponse { status }))
}

async fn ws_game(
    State(ctx): State<MatchContext>,
    Query(q): Query<GameQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let identity = ctx.auth.resolve(&q.token).await.map_err(reject)?;
    let handle = match q.intent {
        Intent::Play => establish(&ctx, &identity).await.map_err(reject)?,
        Intent::Reconnect => reattach(&ctx, &identity).await.map_err(reject)?,
    };
    Ok(ws.on_upgrade(move |socket| ConnectionSession::new(ctx, handle).run(socket)))
}

async fn ws_spectate(
    State(ctx): State<MatchContext>,
    Path(match_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay::run_spectator(ctx, socket, match_id))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = ServerConfig::parse();
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresence::new(config.presence_ttl()));
    let ctx = MatchContext {
        registry: Arc::new(MatchRegistry::new()),
        relay: Arc::new(InProcessRelay::new()),
        presence: presence.clone(),
        persistence: Arc::new(MemoryGateway::new()),
        boards: Arc::new(GridBoardFactory),
        auth: Arc::new(TokenResolver),
        matchmaker: Arc::new(Matchmaker::new(presence)),
        config,
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/", get(hello_world))
        .route("/find", get(find_match))
        .route("/bot", get(bot_match))
        .route("/pending", get(pending_match))
        .route("/ws/game", get(ws_game))
        .route("/ws/spectate/{match_id}", get(ws_spectate))
        .with_state(ctx.clone())
        .layer(cors);

    log::info!("Starting match server on {}", ctx.config.addr);
    let listener = tokio::net::TcpListener::bind(&ctx.config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ctx))
        .await?;
    Ok(())
}

async fn shutdown_signal(ctx: MatchContext) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    log::info!("Shutting down, retiring live matches");
    ctx.registry.shutdown().await;
}
