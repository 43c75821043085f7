use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic_reflection::server::Builder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_grpc::{auth_interceptor, pb::clinic_server::ClinicServer, ClinicService};
use api_shared::{auth::ApiKey, FILE_DESCRIPTOR_SET};
use clinic_core::{ClinicServices, CoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("clinic=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr: SocketAddr = std::env::var("CLINIC_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50051".into())
        .parse()?;

    let cfg = CoreConfig::from_env_values(
        std::env::var("CLINIC_DATA_DIR").ok(),
        std::env::var("CLINIC_CARE_LOCATION").ok(),
        std::env::var("CLINIC_STORE").ok(),
    )?;
    let api_key = ApiKey::from_env().map_err(|_| anyhow::anyhow!("API_KEY must be set"))?;
    let services = ClinicServices::open(Arc::new(cfg))?;

    tracing::info!("-- Starting clinic gRPC on {}", addr);

    let mut server_builder = Server::builder().add_service(ClinicServer::with_interceptor(
        ClinicService::new(services),
        auth_interceptor(api_key),
    ));

    if std::env::var("CLINIC_ENABLE_REFLECTION").unwrap_or_else(|_| "false".to_string()) == "true"
    {
        let reflection_service = Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()?;
        server_builder = server_builder.add_service(reflection_service);
        tracing::info!("gRPC server reflection enabled");
    } else {
        tracing::info!("gRPC server reflection disabled");
    }

    server_builder.serve(addr).await?;

    Ok(())
}
