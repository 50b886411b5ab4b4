use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type for device plugin operations.
pub type PluginResult<T> = Result<T, Report<PluginError>>;

/// Errors raised while bringing a plugin instance up or tearing it down.
#[derive(Debug, Display)]
pub enum PluginError {
    #[display("Failed to remove socket file {path}")]
    Cleanup { path: String },

    #[display("Failed to bind socket {path}")]
    Bind { path: String },

    #[display("gRPC server on {path} failed")]
    Serve { path: String },

    #[display("Failed to connect to {endpoint}")]
    Dial { endpoint: String },

    #[display("Failed to register {resource_name} with kubelet")]
    Registration { resource_name: String },

    #[display("Failed to watch {path}")]
    Watch { path: String },

    #[display("Failed to install signal handler")]
    Signal,
}

impl Error for PluginError {}
