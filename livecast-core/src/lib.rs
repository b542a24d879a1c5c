pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod models;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use identity::Identity;
pub use store::{RealtimeStore, StorePaths};
