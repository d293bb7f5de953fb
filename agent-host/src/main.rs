use agent_host::api;
use agent_host::config::Config;
use agent_host::demo::DemoAgent;
use agent_host::host::{AgentHost, HostConfig};
use axum::http::{header, HeaderName, HeaderValue, Method};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_host=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        strategy = ?config.connection_strategy,
        "Starting agent host"
    );

    let class = DemoAgent::class(config.demo_counter_step, config.connection_strategy);
    let host = AgentHost::new(
        class,
        HostConfig {
            data_dir: config.data_dir.clone(),
            in_memory: config.in_memory,
            idle_timeout: config.idle_timeout,
        },
    )
    .await?;
    host.restore_alarms().await?;
    let _watchdog = host.spawn_watchdog(config.eviction_interval);

    let session_header = HeaderName::from_static(agent_host::mcp::SESSION_HEADER);
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, session_header.clone()])
        .expose_headers([session_header])
        .max_age(std::time::Duration::from_secs(3600));
    let cors = if config.cors_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins = config
            .cors_origins
            .iter()
            .map(|origin| HeaderValue::from_str(origin))
            .collect::<Result<Vec<_>, _>>()?;
        cors.allow_origin(AllowOrigin::list(origins))
    };

    let api_state = api::ApiState {
        host,
        max_body_bytes: config.max_body_bytes,
    };
    let app = api::router()
        .with_state(api_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting HTTP server on http://{addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
