//! Invoice trust and automated collections engine.
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;

pub use startup::AppState;
