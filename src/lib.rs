//! Chained identity authentication with layered credential caching.

// Resolution, caching and authentication of identity chains
pub mod auth;

// Environment settings and identity configuration loading
pub mod config;
