pub mod app;
pub mod auth;
pub mod config;
pub mod routes;
pub mod state;
