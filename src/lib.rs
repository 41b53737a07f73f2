pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod execution;
pub mod ledger;
pub mod middleware;
pub mod quote_engine;
pub mod server;
pub mod settlement;
