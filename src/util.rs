use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use actix_web::HttpResponse;
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::chat_service::ChatService;

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Load a dotenv file and report where it came from.
///
/// Order: ENV_FILE, ENVFILE, DOTENV_PATH, then `.envfile`, then `.env` in the working
/// directory, then the first `.env` found walking up from the executable.
fn load_env_file() -> String {
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty() && Path::new(p).is_file() && dotenvy::from_filename(p).is_ok() {
                return format!("{p} ({key})");
            }
        }
    }

    if Path::new(".envfile").is_file() && dotenvy::from_filename(".envfile").is_ok() {
        return ".envfile".into();
    }

    if dotenvy::dotenv().is_ok() {
        return ".env".into();
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir_opt = exe.parent();
        while let Some(dir) = dir_opt {
            let candidate = dir.join(".env");
            if candidate.is_file() && dotenvy::from_filename(&candidate).is_ok() {
                return candidate.display().to_string();
            }
            dir_opt = dir.parent();
        }
    }

    "none".into()
}

/// Initialize dotenv and structured tracing based on RUST_LOG (default `info`).
pub fn init_tracing() {
    let env_source = load_env_file();

    // RUST_LOG may come from the env file loaded above
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Bind address from MODELRELAY_BIND_ADDR or BIND_ADDR, default 0.0.0.0:8088.
pub fn env_bind_addr() -> String {
    std::env::var("MODELRELAY_BIND_ADDR")
        .or_else(|_| std::env::var("BIND_ADDR"))
        .unwrap_or_else(|_| "0.0.0.0:8088".into())
}

/// Build an HTTP client honoring proxy and timeout environment variables.
///
/// Environment:
/// - MODELRELAY_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - MODELRELAY_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / http_proxy              -> HTTP proxy
/// - HTTPS_PROXY / https_proxy            -> HTTPS proxy
/// - MODELRELAY_HTTP_TIMEOUT_SECONDS      -> overall request timeout (u64)
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("MODELRELAY_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }

    let no_proxy = std::env::var("MODELRELAY_NO_PROXY")
        .map(|v| is_truthy(&v))
        .unwrap_or(false);

    if no_proxy {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("MODELRELAY_PROXY_URL") {
            builder = add_proxy(builder, "all", &url, |u| reqwest::Proxy::all(u));
        }
        if let Ok(url) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            builder = add_proxy(builder, "http", &url, |u| reqwest::Proxy::http(u));
        }
        if let Ok(url) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy")) {
            builder = add_proxy(builder, "https", &url, |u| reqwest::Proxy::https(u));
        }
    }

    builder = builder.user_agent(format!("modelrelay/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Falling back to a default HTTP client: {}", e);
        reqwest::Client::new()
    })
}

fn add_proxy(
    builder: reqwest::ClientBuilder,
    scheme: &str,
    url: &str,
    make: fn(&str) -> reqwest::Result<reqwest::Proxy>,
) -> reqwest::ClientBuilder {
    let url = url.trim();
    if url.is_empty() {
        return builder;
    }
    match make(url) {
        Ok(p) => builder.proxy(p),
        Err(e) => {
            tracing::warn!("Ignoring invalid {} proxy {}: {}", scheme, url, e);
            builder
        }
    }
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub chat: Arc<ChatService>,
    /// Human readable description of the recommendation oracle, e.g. `http://router:9090`
    pub router_description: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(chat: Arc<ChatService>, router_description: impl Into<String>) -> Self {
        Self {
            chat,
            router_description: router_description.into(),
            started_at: Instant::now(),
        }
    }
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
    )
}

/// CORS settings from CORS_ALLOWED_ORIGINS, CORS_ALLOWED_METHODS,
/// CORS_ALLOWED_HEADERS, CORS_ALLOW_CREDENTIALS and CORS_MAX_AGE.
///
/// Unset lists are permissive.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match env_list("CORS_ALLOWED_ORIGINS") {
        Some(origins) if !origins.iter().any(|o| o == "*") => {
            for origin in &origins {
                cors = cors.allowed_origin(origin);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match env_list("CORS_ALLOWED_METHODS") {
        Some(methods) if !methods.is_empty() && !methods.iter().any(|m| m == "*") => {
            cors = cors.allowed_methods(methods.iter().map(String::as_str));
        }
        _ => cors = cors.allow_any_method(),
    }

    match env_list("CORS_ALLOWED_HEADERS") {
        Some(headers) if !headers.is_empty() && !headers.iter().any(|h| h == "*") => {
            for header in &headers {
                cors = cors.allowed_header(header.as_str());
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if std::env::var("CORS_ALLOW_CREDENTIALS")
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
    {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" YES "));
        assert!(!is_truthy("off"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_error_response_status() {
        let resp = error_response(StatusCode::NOT_FOUND, "missing");
        assert_eq!(resp.status().as_u16(), 404);
    }
}
