pub mod ports;
pub mod probe;

pub use ports::{PortMapper, SetBindingOptions};
