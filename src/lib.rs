#![forbid(unsafe_code)]

pub mod channel;
pub mod client;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod errors;
pub mod interpreter;
pub mod ipc;
pub mod memory;
pub mod platform;
pub mod pool;
pub mod resource_lock;
pub mod session;
pub mod suspend;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
