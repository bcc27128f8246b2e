//! Artwork Generation Gateway
//!
//! This library provides the core functionality for artgen-gateway, which
//! mediates access to a slow and unreliable external image-generation API:
//! a durable PostgreSQL job queue, an adaptive circuit breaker, a
//! budget-capped recovery prober, and a dead-letter quarantine.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
