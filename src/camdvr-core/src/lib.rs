//! camdvr Core Library
//!
//! Connection supervision, frame distribution and application configuration.

pub mod config;
pub mod distributor;
pub mod preview;
pub mod supervisor;

pub use config::AppConfig;
pub use distributor::FrameDistributor;
pub use preview::{PreviewReceiver, PreviewSender};
pub use supervisor::{ConnectError, ConnectionState, ReconnectPolicy, Supervisor, SupervisorStats};
