//! vmon-transport: IO boundary towards the device.
//! Push channel sessions (WebSocket) and streaming command execution
//! (HTTP). Decisions about what to run and when live in vmon-core.

pub mod error;
pub mod executor;
pub mod push;
pub mod runner;

pub use error::{CommandError, TransportError};
pub use executor::{
    ActiveRegions, CommandStreamExecutor, RegionPermit, RunHandle, RunOptions, RunOutcome,
    SharedRegion, Watchdog, shared_region,
};
pub use push::{
    PushConnector, PushStream, SessionState, TransportEvent, TransportManager, WsConnector,
};
pub use runner::{CommandRunner, HttpCommandRunner, ResponseBody};
