pub mod codec;
pub mod config;
pub mod outcome;
pub mod redis;
pub mod types;
