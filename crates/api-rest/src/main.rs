//! Standalone REST API server binary.
//!
//! Runs only the REST server (with OpenAPI/Swagger UI). Useful during development; the
//! workspace's main `clinic-run` binary runs gRPC and REST together over one store.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clinic_core::{ClinicServices, CoreConfig};

/// # Environment Variables
/// - `CLINIC_REST_ADDR`: server address (default: "0.0.0.0:3000")
/// - `CLINIC_DATA_DIR`, `CLINIC_CARE_LOCATION`, `CLINIC_STORE`: see [`CoreConfig`]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("clinic=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("CLINIC_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let cfg = CoreConfig::from_env_values(
        std::env::var("CLINIC_DATA_DIR").ok(),
        std::env::var("CLINIC_CARE_LOCATION").ok(),
        std::env::var("CLINIC_STORE").ok(),
    )?;
    let services = ClinicServices::open(Arc::new(cfg))?;

    tracing::info!("-- Starting clinic REST API on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, api_rest::router(services)).await?;

    Ok(())
}
