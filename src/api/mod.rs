//! Thin HTTP trigger surface over the diagnosis pipeline.

pub mod error;
pub mod router;
pub mod types;

pub use error::ApiError;
pub use router::api_router;
pub use types::ApiContext;
