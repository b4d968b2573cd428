//! Guest service ports and default host port ranges.

/// noVNC web console inside the guest container.
pub const GUEST_NOVNC_PORT: u16 = 8006;

/// Guest agent HTTP API.
pub const GUEST_API_PORT: u16 = 7148;

/// Hypervisor control channel (QMP).
pub const GUEST_QMP_PORT: u16 = 7149;

/// Remote desktop.
pub const GUEST_RDP_PORT: u16 = 3389;

/// Default host address published ports bind to.
pub const DEFAULT_HOST_ADDR: &str = "127.0.0.1";

/// Host port range reserved for the noVNC console.
pub const NOVNC_PORT_RANGE: (u16, u16) = (47270, 47279);

/// Host port range reserved for the guest API.
pub const GUEST_API_PORT_RANGE: (u16, u16) = (47280, 47289);

/// Host port range reserved for QMP.
pub const QMP_PORT_RANGE: (u16, u16) = (47290, 47299);

/// Host port range reserved for RDP.
pub const RDP_PORT_RANGE: (u16, u16) = (47300, 47309);
