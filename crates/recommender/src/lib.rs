//! VPA recommender service: HTTP API, configuration and shared stores

pub mod api;
pub mod config;
pub mod state;
