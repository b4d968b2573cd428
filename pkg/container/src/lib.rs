pub mod backend;
pub mod engine;
pub mod firmware;
pub mod host;
pub mod native;
pub mod process;
pub mod runtime;
pub mod state;

pub use backend::{ComposeDirection, HostProbe, LifecycleAction, RuntimeManager};
pub use engine::EngineBackend;
pub use native::NativeBackend;
pub use runtime::{create_manager, probe_host};
