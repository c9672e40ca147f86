mod api;
mod error;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use api::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use stepruntime::{ActionRegistry, EngineConfig, ExecutionSupervisor};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// `STEPWISE_CONFIG` if set, defaults otherwise; `STEPWISE_*` variables win.
fn load_config() -> anyhow::Result<EngineConfig> {
    let config = match std::env::var_os("STEPWISE_CONFIG").map(PathBuf::from) {
        Some(path) => EngineConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting stepwise server");

    let config = load_config()?;

    let mut registry = ActionRegistry::new();
    stepactions::register_all(&mut registry);
    let action_count = registry.list_action_types().len();

    let supervisor = ExecutionSupervisor::new(config.clone(), Arc::new(registry));

    info!(
        actions = action_count,
        max_concurrent_executions = config.max_concurrent_executions,
        max_concurrent_steps = config.max_concurrent_steps,
        "Supervisor initialized"
    );

    let app_state = web::Data::new(AppState {
        supervisor: Arc::new(supervisor),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
