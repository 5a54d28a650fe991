pub mod backend;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod live;
pub mod logging;
pub mod state;

pub use config::{ClientConfig, ClientConfigArgs};
pub use error::ClientError;
pub use live::types::{CanonicalState, ConnectionState};
pub use live::LiveClient;
