pub mod guest;
pub mod instance;

pub use guest::{GuestClient, GuestMetrics, GuestVersion};
pub use instance::{ControlChannelState, InstanceSupervisor, SupervisorHandle, SupervisorSnapshot};
