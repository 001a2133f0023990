// Library exports for the server binary and integration tests

pub mod config;
pub mod error;
pub mod export;
pub mod models;
pub mod server;
pub mod source;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
