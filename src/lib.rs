// Library exports for Petagram
// The binary and the integration tests both build on these modules

pub mod auth;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod feed;
pub mod interactions;
pub mod locks;
pub mod models;
pub mod remote;
pub mod upload;

pub use context::{AppContext, ClientSettings};
pub use error::{AppError, AppResult};
