pub mod config;
pub mod evaluator;
pub mod routes;
pub mod sandbox;
pub mod web_server;
