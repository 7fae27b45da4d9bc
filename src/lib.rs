// Library interface for kbridge
// The two binaries and the integration tests are built on these modules

pub mod daemon;
pub mod error;
pub mod kernel;
pub mod logging;

pub use daemon::{BridgeClient, BridgeConfig, BridgeServer};
pub use error::{BridgeError, Result};
pub use kernel::{ExecutionError, ExecutionResult, TracebackFrame};
