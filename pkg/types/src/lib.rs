pub mod capability;
pub mod compose;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod port;
pub mod runtime;
pub mod validate;
