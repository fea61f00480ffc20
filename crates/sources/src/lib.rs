//! The ingest side of the data plane: discovers log files and containers,
//! tails each one, and hands lines to the dispatcher as [`core_types::Record`]s.
//! [`PositionStore`] is the only state that survives a restart.
mod container_monitor;
mod container_stream;
mod file_monitor;
mod metrics;
mod position_store;
mod self_monitor;

pub use container_monitor::ContainerMonitor;
pub use container_stream::{
    ManagedStream,
    StreamItem,
};
pub use file_monitor::FileMonitor;
pub use position_store::PositionStore;
pub use self_monitor::SelfMonitor;
