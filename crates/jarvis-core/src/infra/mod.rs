//! Infra clients: pooled SSH and the Proxmox REST client.

pub mod container;
pub mod proxmox;
pub mod ssh;

pub use container::ContainerRestartController;
pub use proxmox::ProxmoxClient;
pub use ssh::{exec_with_timeout, PtyHandle, SshPool};
