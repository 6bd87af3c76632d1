pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod refresh;
pub mod registry;
pub mod remote;
pub mod sanitize;
pub mod selector;
pub mod session;
pub mod status;
pub mod ui;

pub use error::{Error, Result};
