//! Fleet Live Library
//!
//! Live, authenticated daemon sessions for a fleet of managed workloads.
//! `live` holds the per-entity connection machinery, `fleet` the keyed
//! registry dashboards read from.

pub mod config;
pub mod fleet;
pub mod live;

pub use config::{ManagerConfig, PanelConfig};
pub use fleet::{FleetRegistry, LiveSnapshot};
pub use live::{ConnectOutcome, ConnectionStatus, LiveConnection, LiveDeps, Liveness};
