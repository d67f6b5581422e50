use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;

use modelrelay::chat_history_manager::{ChatHistoryConfig, ChatHistoryManager};
use modelrelay::chat_service::{ChatService, RelayConfig};
use modelrelay::pricing::PricingConfig;
use modelrelay::provider_registry::{ProviderRegistry, ProviderSource};
use modelrelay::router_client::{
    HttpRouterClient, HttpRouterConfig, LocalPolicyRouter, RouterClient,
};
use modelrelay::util::{
    build_http_client_from_env, cors_config_from_env, env_bind_addr, init_tracing, AppState,
};

#[derive(Parser, Debug)]
#[command(name = "modelrelay", version)]
#[command(about = "Route chat messages across AI model vendors over one NDJSON stream")]
struct Args {
    /// Address to bind the HTTP server to
    #[arg(long, env = "MODELRELAY_BIND_ADDR")]
    bind: Option<String>,

    /// Remote recommendation oracle base URL; the embedded catalog router is used when unset
    #[arg(long, env = "MODELRELAY_ROUTER_URL")]
    router_url: Option<String>,

    /// Oracle request timeout in milliseconds
    #[arg(long, env = "MODELRELAY_ROUTER_TIMEOUT_MS", default_value_t = 2000)]
    router_timeout_ms: u64,

    /// JSON or YAML model catalog for the embedded router
    #[arg(long, env = "MODELRELAY_CATALOG_PATH")]
    catalog: Option<String>,

    /// JSON or YAML pricing overrides
    #[arg(long, env = "MODELRELAY_PRICING_PATH")]
    pricing: Option<String>,

    /// History backend: memory or jsonl
    #[arg(long, env = "MODELRELAY_HISTORY_BACKEND")]
    history_backend: Option<String>,

    /// JSONL history file
    #[arg(long, env = "MODELRELAY_HISTORY_JSONL_PATH")]
    history_path: Option<String>,

    /// Vendor assumed for manual model ids with no known prefix
    #[arg(long, env = "MODELRELAY_DEFAULT_VENDOR")]
    default_vendor: Option<String>,

    /// System prompt sent with every request
    #[arg(long, env = "MODELRELAY_SYSTEM_PROMPT")]
    system_prompt: Option<String>,
}

fn build_router(args: &Args) -> Result<(Arc<dyn RouterClient>, String)> {
    if let Some(url) = args.router_url.as_deref().filter(|u| !u.trim().is_empty()) {
        let client = HttpRouterClient::new(HttpRouterConfig {
            url: url.trim().to_string(),
            timeout_ms: args.router_timeout_ms,
            client: None,
        })?;
        return Ok((Arc::new(client), url.trim().to_string()));
    }
    match args.catalog.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(path) => {
            let router = LocalPolicyRouter::from_file(path)
                .with_context(|| format!("loading model catalog {}", path))?;
            Ok((Arc::new(router), format!("local:{}", path)))
        }
        None => Ok((Arc::new(LocalPolicyRouter::builtin()), "local:builtin".to_string())),
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let http = build_http_client_from_env();
    let registry = Arc::new(ProviderRegistry::from_env(http));
    for status in registry.status() {
        tracing::info!("Vendor {}: usable={}", status.vendor, status.usable);
    }

    let (router, router_description) = build_router(&args)?;

    let pricing = match args.pricing.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(path) => PricingConfig::load_from_file(path.trim())
            .with_context(|| format!("loading pricing {}", path))?,
        None => PricingConfig::default(),
    };

    let mut history_config = ChatHistoryConfig::from_env();
    if let Some(backend) = args.history_backend.clone() {
        history_config.primary_backend = backend.trim().to_ascii_lowercase();
    }
    if let Some(path) = args.history_path.clone() {
        history_config.jsonl_path = Some(path);
    }
    let history = ChatHistoryManager::new(history_config)
        .await
        .context("initializing chat history")?;

    let mut relay_config = RelayConfig::from_env();
    if let Some(vendor) = args.default_vendor.as_deref() {
        relay_config.default_vendor = vendor.parse()?;
    }
    if let Some(prompt) = args.system_prompt.clone() {
        relay_config.system_prompt = prompt;
    }

    let chat = Arc::new(ChatService::new(
        relay_config,
        registry,
        router,
        Arc::new(history),
        Arc::new(pricing),
    ));
    let state = web::Data::new(AppState::new(chat, router_description.clone()));

    let addr = args.bind.clone().unwrap_or_else(env_bind_addr);
    tracing::info!("modelrelay listening on {} (router: {})", addr, router_description);

    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(modelrelay::server::config_routes)
    })
    .bind(&addr)
    .with_context(|| format!("binding {}", addr))?
    .run()
    .await?;

    Ok(())
}
