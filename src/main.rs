use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;

use chat_relay::config::RelayConfig;
use chat_relay::gateway::{ModelGateway, OpenAiGateway, RetryingGateway};
use chat_relay::server::config_routes;
use chat_relay::util::{build_http_client, cors_config_from_env, init_tracing, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RelayConfig::parse();
    config.validate()?;

    match config.api_key_hint() {
        Some(hint) => tracing::info!("API key loaded: {}", hint),
        None => tracing::warn!(
            "OPENAI_API_KEY is not set; chat requests will fail until it is configured"
        ),
    }

    let upstream = OpenAiGateway::new(build_http_client(config.read_timeout()), config.upstream());
    let gateway: Arc<dyn ModelGateway> = if config.unary_retries > 0 {
        Arc::new(RetryingGateway::new(upstream, config.unary_retries))
    } else {
        Arc::new(upstream)
    };
    let state = web::Data::new(AppState::new(gateway, &config));

    tracing::info!(
        bind = %config.bind_addr,
        model = %config.model,
        base_url = %config.base_url,
        delivery_mode = config.delivery_mode.as_str(),
        "starting chat relay"
    );

    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await?;

    Ok(())
}
