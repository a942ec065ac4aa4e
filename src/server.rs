use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use tracing::Instrument;
use uuid::Uuid;

use crate::conversation;
use crate::error::{ClassifiedError, RelayFailure};
use crate::gateway::{DeliveryMode, GatewayOutput, ModelInvocation};
use crate::models::{ChatReply, ChatRequest};
use crate::stream_encoder;
use crate::util::{preview, AppState};

const ROUTES: [&str; 2] = ["/status", "/api/chat"];

/// JSON extractor settings: body errors become validation responses in the
/// relay's error format. A missing credential still takes precedence, as it
/// does for well-formed bodies.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, req: &HttpRequest| {
        let credential = req
            .app_data::<web::Data<AppState>>()
            .map(|state| state.gateway.ensure_credential());
        let failure = match credential {
            Some(Err(missing)) => RelayFailure::Gateway(missing),
            _ => RelayFailure::MalformedBody(err.to_string()),
        };
        ClassifiedError::from(failure).into()
    })
}

/// Configure Actix-web routes. Expects `web::Data<AppState>` to be registered.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config()).service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/api/chat", web::post().to(chat)),
    );
}

/// Service status: configured model, credential presence and default delivery mode.
async fn status(state: web::Data<AppState>) -> impl Responder {
    web::Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.model,
        "credential_configured": state.gateway.ensure_credential().is_ok(),
        "default_delivery_mode": state.default_mode.as_str(),
        "routes": ROUTES,
    }))
}

fn delivery_mode(request: &ChatRequest, default_mode: DeliveryMode) -> DeliveryMode {
    match request.stream {
        Some(true) => DeliveryMode::Streaming,
        Some(false) => DeliveryMode::Unary,
        None => default_mode,
    }
}

/// `POST /api/chat`: relay one user message (plus prior turns) upstream.
///
/// Returns a single JSON body in unary mode, or an SSE stream of
/// `{content, done, fullMessage?}` events in streaming mode. Every failure
/// before the first byte is exactly one classified JSON error.
async fn chat(
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, ClassifiedError> {
    let request = body.into_inner();
    let mode = delivery_mode(&request, state.default_mode);
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("chat", %request_id, mode = mode.as_str());

    relay_chat(&state, request, mode).instrument(span).await
}

async fn relay_chat(
    state: &AppState,
    request: ChatRequest,
    mode: DeliveryMode,
) -> Result<HttpResponse, ClassifiedError> {
    state
        .gateway
        .ensure_credential()
        .map_err(RelayFailure::from)?;

    let message = request.message.unwrap_or_default();
    let turns = conversation::assemble(&message, &request.history)?;
    tracing::debug!(
        message = %preview(&message, 50),
        history_len = request.history.len(),
        "relaying chat request"
    );

    let invocation = ModelInvocation {
        turns,
        params: state.sampling,
        mode,
    };

    match state
        .gateway
        .invoke(&invocation)
        .await
        .map_err(RelayFailure::from)?
    {
        GatewayOutput::Complete(text) => {
            tracing::debug!(reply = %preview(&text, 50), "unary reply received");
            Ok(HttpResponse::Ok().json(ChatReply::success(text)))
        }
        GatewayOutput::Stream(chunks) => {
            tracing::info!("streaming reply started");
            let events = stream_encoder::encode(chunks).with_span(tracing::Span::current());
            Ok(HttpResponse::Ok()
                .insert_header((header::CONTENT_TYPE, "text/event-stream"))
                .insert_header((header::CACHE_CONTROL, "no-cache"))
                .insert_header(("x-accel-buffering", "no"))
                .streaming(events))
        }
    }
}
