//! Backend store implementations.

pub mod http;

pub use http::HttpBackendStore;
