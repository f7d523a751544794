//! Configuration module for tcp-redirect
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tcp_redirect::config::load_config;
//!
//! let config = load_config("/etc/tcp-redirect/config.json").unwrap();
//! println!("Listening on {}", config.listen.address);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{Config, ListenConfig, LogConfig, SessionConfig};
