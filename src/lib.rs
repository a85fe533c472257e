pub mod algorithms;
pub mod common;
pub mod env;
