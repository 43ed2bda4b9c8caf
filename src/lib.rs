#![forbid(unsafe_code)]

pub mod app;
pub mod cli;
pub mod error;
pub mod generate;
pub mod generator;
pub mod logging;
pub mod model;
pub mod openai;
pub mod orchestrator;
pub mod progress;
pub mod rate_limit;
pub mod status;
pub mod store;
