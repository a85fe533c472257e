pub mod config;
pub mod model;
pub mod runtime;
pub mod telemetry;
pub mod utils;
