pub mod analysis;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod engines;
pub mod errors;
pub mod gate;
pub mod logging;
pub mod observe;
pub mod orchestrator;
pub mod runner;
pub mod stream;
pub mod ui;
