//! Recurring fee collection ("gas-bag" upkeep).

pub mod containers;
pub mod daemon;

pub use containers::{ContainerManager, HttpContainerManager, StopAuthorization};
pub use daemon::{TickReport, UpkeepDaemon};
