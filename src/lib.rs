//! Trigger Trader Library
//!
//! Trigger-based automated trading for Solana: watch tasks for copy trading,
//! pool sniping and limit orders, evaluated continuously and executed through
//! pluggable swap and custody gateways.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod strategy;
pub mod task;

// Re-export commonly used types
pub use config::Config;
pub use engine::{Engine, EngineSettings, Gateways};
pub use error::{Error, ErrorKind, Result};
pub use task::{EngineEvent, TaskRegistry, TaskSpec, TaskState, WatchTask};
