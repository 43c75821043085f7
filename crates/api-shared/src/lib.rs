//! # API Shared
//!
//! Shared utilities and definitions for the clinic APIs.
//!
//! Contains:
//! - Protobuf-generated types (`pb` module)
//! - Conversions between protobuf messages and `clinic-core` types
//! - Shared services like `HealthService`
//! - Authentication utilities: API keys and actor headers (usable by both gRPC and REST)
//! - Mapping of core errors onto gRPC status codes
//!
//! Used by `api-grpc` and `api-rest` for common functionality.

// The generated code is placed into OUT_DIR at build time by the build script.
pub mod pb {
    tonic::include_proto!("clinic.v1");
}

pub mod auth;
pub mod convert;
pub mod health;
pub mod status;

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("proto_descriptor");

pub use health::HealthService;
pub use pb::*;
