use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_grpc::{ClinicService, auth_interceptor};
use api_shared::auth::ApiKey;
use api_shared::pb::clinic_server::ClinicServer;
use clinic_core::{ClinicServices, CoreConfig};

/// Main entry point for the clinic records service.
///
/// Opens one store and serves it over gRPC and REST concurrently:
/// - gRPC on `CLINIC_ADDR` (default "0.0.0.0:50051"), every call requires `x-api-key`
/// - REST on `CLINIC_REST_ADDR` (default "0.0.0.0:3000"), with Swagger UI at `/swagger-ui`
///
/// # Environment Variables
/// - `CLINIC_DATA_DIR`: record storage directory (default: "clinic_data")
/// - `CLINIC_CARE_LOCATION`: clinic name written into every commit (required)
/// - `CLINIC_STORE`: `git` or `memory` (default: `git`)
/// - `API_KEY`: API key for gRPC authentication (required)
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("clinic=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let grpc_addr: SocketAddr = std::env::var("CLINIC_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50051".into())
        .parse()?;
    let rest_addr = std::env::var("CLINIC_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let cfg = CoreConfig::from_env_values(
        std::env::var("CLINIC_DATA_DIR").ok(),
        std::env::var("CLINIC_CARE_LOCATION").ok(),
        std::env::var("CLINIC_STORE").ok(),
    )?;
    let api_key = ApiKey::from_env().map_err(|_| anyhow::anyhow!("API_KEY must be set"))?;
    let services = ClinicServices::open(Arc::new(cfg))?;

    tracing::info!("++ Starting clinic gRPC on {}", grpc_addr);
    tracing::info!("++ Starting clinic REST on {}", rest_addr);

    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    let rest_app = api_rest::router(services.clone());
    let rest_server = tokio::spawn(async move { axum::serve(listener, rest_app).await });

    let grpc_server = Server::builder()
        .add_service(ClinicServer::with_interceptor(
            ClinicService::new(services),
            auth_interceptor(api_key),
        ))
        .serve(grpc_addr);

    let (rest_result, grpc_result) = tokio::join!(rest_server, grpc_server);
    rest_result??;
    grpc_result?;

    Ok(())
}
