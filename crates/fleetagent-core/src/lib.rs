pub mod config;
pub mod context;
pub mod controller;
pub mod dispatcher;
pub mod guards;
pub mod handlers;
pub mod host;
pub mod jobs;
pub mod lifecycle;

pub use config::*;
pub use context::*;
pub use controller::ControllerClient;
pub use dispatcher::*;
pub use guards::*;
pub use handlers::default_registry;
pub use host::{HostOps, LinuxHost, PackageManagerStatus};
pub use lifecycle::*;
