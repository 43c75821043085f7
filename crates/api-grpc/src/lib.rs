//! # API gRPC
//!
//! gRPC server implementation for the clinic records service.
//!
//! Handles:
//! - gRPC service setup and API-key authentication
//! - Service implementations using `clinic-core` for record operations
//! - gRPC-specific concerns (interceptors, metadata, tonic integration)
//!
//! Uses `api-shared` for common types and utilities.

#![warn(rust_2018_idioms)]

pub use service::{auth_interceptor, pb, ClinicService};

pub mod service;
