//! vmon-core: pure client-side state for the device monitor.
//! Metric snapshot, restart detection, inbound message shapes, reconnect
//! inhibition, widget scheduling and output assembly. No IO, no async.

pub mod history;
pub mod inhibit;
pub mod message;
pub mod output;
pub mod region;
pub mod reload;
pub mod scheduler;
pub mod store;
pub mod timeout;

pub use history::ShellHistory;
pub use inhibit::ReconnectGate;
pub use message::{ClientEvent, Event, InboundMessage, MessageError, MetricDelta};
pub use output::{DeltaTracker, OutputMode, OutputWriter, ResponseText, escape_control, escape_markup};
pub use region::{BufferRegion, DisplayRegion, RegionId};
pub use reload::{DEFAULT_MONOTONIC_KEY, ReloadGuard, ReloadRequired, counter_value};
pub use scheduler::{PatternError, RefreshRequest, WidgetId, WidgetScheduler, WidgetSpec};
pub use store::{MetricSnapshot, StateStore};
pub use timeout::TimeoutPolicy;
