pub mod config;
pub mod models;
pub mod multimodal;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
