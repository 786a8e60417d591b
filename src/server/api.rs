use crate::cli::Args;
use crate::errors::{ ChatError, RATE_LIMITED };
use crate::models::chat::ApiEnvelope;
use crate::models::request::ChatProcessRequest;
use crate::orchestrator::{ ChatEvent, ChatEventStream, ChatOrchestrator };
use axum::{
    extract::{ rejection::JsonRejection, State },
    http::{ header::HeaderName, HeaderValue, StatusCode },
    response::{ sse::{ Event, Sse }, IntoResponse, Response },
    routing::post,
    Json,
    Router,
};
use futures::{ stream, StreamExt };
use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use log::{ error, info, warn };
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::cors::{ Any, CorsLayer };

type RequestLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<ChatOrchestrator>,
    limiter: Option<Arc<RequestLimiter>>,
}

impl AppState {
    /// `per_second` of 0 leaves `/chat-process` unthrottled.
    pub fn new(orchestrator: Arc<ChatOrchestrator>, per_second: u32) -> Self {
        let limiter = NonZeroU32::new(per_second).map(|rate| {
            Arc::new(RateLimiter::direct(Quota::per_second(rate)))
        });
        Self { orchestrator, limiter }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/chat-process", post(chat_process_handler))
        .route("/config", post(config_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    state: AppState,
    args: &Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = args.server_addr.parse::<SocketAddr>()?;
    let app = build_router(state);

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;
            info!("Starting HTTPS server on: https://{}", addr);
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        }
        (true, _, _) => {
            return Err("ENABLE_TLS is set but TLS_CERT_PATH or TLS_KEY_PATH is missing".into());
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                e
            })?;
            info!("Starting HTTP server on: http://{}", addr);
            axum::serve(listener, app.into_make_service()).await?;
        }
    }

    Ok(())
}

async fn chat_process_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatProcessRequest>, JsonRejection>
) -> Response {
    if let Some(limiter) = &state.limiter {
        if limiter.check().is_err() {
            warn!("Rate limit exceeded for /chat-process");
            let body = ApiEnvelope::failure(RATE_LIMITED, "Too many requests, please try again later.");
            return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        }
    }

    let events: ChatEventStream = match body {
        Ok(Json(request)) => state.orchestrator.process(request),
        Err(rejection) => {
            let reason = rejection.body_text();
            warn!("Rejected /chat-process body: {}", reason);
            let failure = ChatEvent::Failed(ChatError::InvalidRequest(reason));
            Box::pin(stream::once(async move { failure }))
        }
    };

    event_stream_response(events)
}

fn event_stream_response(events: ChatEventStream) -> Response {
    let frames = events.map(|event| Ok::<_, Infallible>(sse_event(event)));
    let mut response = Sse::new(frames).into_response();
    response
        .headers_mut()
        .insert(HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"));
    response
}

async fn config_handler() -> Json<ApiEnvelope> {
    Json(ApiEnvelope::success())
}

fn sse_event(event: ChatEvent) -> Event {
    let payload = match event {
        ChatEvent::Fragment(fragment) => serde_json::to_string(&fragment),
        ChatEvent::Failed(e) =>
            serde_json::to_string(&ApiEnvelope::failure(e.code(), e.public_message())),
    };
    match payload {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            error!("Failed to encode chat event: {}", e);
            Event::default().data(r#"{"message":null,"status":"Fail","data":null}"#)
        }
    }
}
