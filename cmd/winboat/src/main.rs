mod context;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use pkg_container::{ComposeDirection, LifecycleAction, probe_host};
use pkg_controllers::{InstanceSupervisor, SupervisorSnapshot};
use pkg_network::{PortMapper, SetBindingOptions};
use pkg_types::capability::resolve;
use pkg_types::config::UsbDeviceRef;
use pkg_types::port::Protocol;
use pkg_types::runtime::RuntimeKind;

use crate::context::AppContext;

#[derive(Parser)]
#[command(name = "winboat", about = "Run a Windows guest through Docker, Podman or QEMU")]
struct Cli {
    /// Application data directory (default: ~/.winboat)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show instance status
    Status,
    /// Show declared and resolved port bindings
    Ports,
    /// Create and start the instance
    Up {
        /// Extra arguments passed to the backend
        #[arg(last = true)]
        extra: Vec<String>,
    },
    /// Stop and tear down the instance
    Down,
    Start,
    Stop,
    Restart,
    Pause,
    Unpause,
    /// Remove the instance
    Remove,
    /// Check host prerequisites for the configured runtime
    Probe,
    /// Show which runtimes this host supports
    Capabilities,
    /// Inspect or edit the instance descriptor
    Descriptor {
        #[command(subcommand)]
        action: DescriptorAction,
    },
    /// Inspect or edit the persisted config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Send a raw QMP command to the running instance
    Qmp {
        command: String,
        /// JSON object with the command arguments
        args: Option<String>,
    },
    /// Query the in-guest agent
    Guest {
        #[command(subcommand)]
        action: GuestAction,
    },
    /// Pass USB devices through to the running guest
    Usb {
        #[command(subcommand)]
        action: UsbAction,
    },
    /// Follow the instance until interrupted
    Supervise,
}

#[derive(Subcommand)]
enum DescriptorAction {
    /// Print the descriptor, creating the default one if missing
    Show,
    /// Overwrite the descriptor with the default for this host
    Reset,
    /// Pin a guest port to a fixed host port
    SetPort {
        container_port: u16,
        host_port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
        #[arg(long)]
        address: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Switch to another runtime
    SetRuntime { kind: RuntimeKind },
}

#[derive(Subcommand)]
enum GuestAction {
    Health,
    Version,
    Metrics,
    Rdp,
    Apps,
}

#[derive(Subcommand)]
enum UsbAction {
    /// Attach a device, given as VENDOR:PRODUCT in hex
    Attach { device: String },
    /// Detach a previously attached device
    Detach { device: String },
}

fn parse_usb_id(device: &str) -> Result<(u16, u16, UsbDeviceRef)> {
    let (vendor, product) = device
        .split_once(':')
        .context("expected VENDOR:PRODUCT, e.g. 046d:c52b")?;
    let parse = |s: &str| {
        u16::from_str_radix(s.trim_start_matches("0x"), 16)
            .with_context(|| format!("invalid USB id {:?}", s))
    };
    let (v, p) = (parse(vendor)?, parse(product)?);
    let device = UsbDeviceRef {
        vendor_id: format!("{:04x}", v),
        product_id: format!("{:04x}", p),
        alias: None,
    };
    Ok((v, p, device))
}

fn print_snapshot(snap: &SupervisorSnapshot) {
    let ports: Vec<String> = snap.ports.iter().map(|p| p.to_string()).collect();
    println!(
        "status={} control={:?} guest={} version={} ports=[{}]",
        snap.status,
        snap.control_channel,
        if snap.guest_healthy { "healthy" } else { "-" },
        snap.guest_version
            .as_ref()
            .map(|v| v.version.as_str())
            .unwrap_or("-"),
        ports.join(", ")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let ctx = AppContext::init(cli.data_dir.clone())?;
    let manager = ctx.manager.clone();

    match &cli.command {
        Commands::Status => {
            let status = manager.status().await;
            println!("Runtime:   {}", ctx.kind());
            println!("Instance:  {}", ctx.app_dir.display());
            println!("Status:    {}", status);
            println!("Exists:    {}", manager.exists().await);
            if let Some(reason) = &ctx.capabilities.unsupported_reason {
                println!("Note:      {}", reason);
            }
        }
        Commands::Ports => {
            let descriptor = manager.ensure_descriptor().await?;
            let mut mapper = PortMapper::from_descriptor(&descriptor);
            let resolved = manager.port().await;
            mapper.apply_resolved(&resolved);

            println!("{:<28} {:<10} {}", "DECLARED", "GUEST", "RESOLVED");
            for b in mapper.bindings() {
                let host = mapper
                    .get_resolved_binding(b.container_port, b.protocol)
                    .map(|r| r.host_port.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<28} {:<10} {}",
                    b.to_token(),
                    format!("{}/{}", b.container_port, b.protocol),
                    host
                );
            }
        }
        Commands::Up { extra } => {
            ctx.require_supported()?;
            manager.apply(ComposeDirection::Up, extra).await?;
            println!("{} is up", manager.name());
        }
        Commands::Down => {
            manager.apply(ComposeDirection::Down, &[]).await?;
            println!("{} is down", manager.name());
        }
        Commands::Start
        | Commands::Stop
        | Commands::Restart
        | Commands::Pause
        | Commands::Unpause => {
            let action = match &cli.command {
                Commands::Start => LifecycleAction::Start,
                Commands::Stop => LifecycleAction::Stop,
                Commands::Restart => LifecycleAction::Restart,
                Commands::Pause => LifecycleAction::Pause,
                _ => LifecycleAction::Unpause,
            };
            if matches!(action, LifecycleAction::Start | LifecycleAction::Restart) {
                ctx.require_supported()?;
            }
            manager.lifecycle(action).await?;
            println!("{}: {}", action, manager.status().await);
        }
        Commands::Remove => {
            manager.remove().await?;
            println!("removed");
        }
        Commands::Probe => {
            let probe = probe_host(ctx.kind(), &ctx.app_dir).await;
            let show = |v: Option<bool>| match v {
                Some(true) => "yes",
                Some(false) => "NO",
                None => "n/a",
            };
            println!("Runtime:          {}", ctx.kind());
            println!("Engine:           {}", show(probe.engine));
            println!("Compose:          {}", show(probe.compose));
            println!("Hypervisor:       {}", show(probe.hypervisor));
            println!("Disk tool:        {}", show(probe.disk_tool));
            println!("Firmware code:    {}", show(probe.firmware_code));
            println!("Firmware vars:    {}", show(probe.firmware_vars));
            println!("Acceleration:     {}", show(probe.acceleration));
            println!("Ready:            {}", probe.ready());
        }
        Commands::Capabilities => {
            println!(
                "{:<8} {:<10} {:<8} {:<10} {:<5} {}",
                "RUNTIME", "SUPPORTED", "QMP", "AUTOSTART", "USB", "NOTE"
            );
            for kind in RuntimeKind::ALL {
                let caps = resolve(kind, &ctx.host, &ctx.flags);
                println!(
                    "{:<8} {:<10} {:<8} {:<10} {:<5} {}",
                    kind.as_str(),
                    caps.supported_on_host,
                    caps.supports_control_channel,
                    caps.supports_auto_start,
                    caps.supports_usb_passthrough,
                    caps.unsupported_reason
                        .map(|r| r.to_string())
                        .unwrap_or_default()
                );
            }
        }
        Commands::Descriptor { action } => match action {
            DescriptorAction::Show => {
                let descriptor = manager.ensure_descriptor().await?;
                print!("{}", descriptor.to_yaml()?);
            }
            DescriptorAction::Reset => {
                manager.write_descriptor(&manager.default_descriptor()).await?;
                println!("descriptor reset: {}", manager.descriptor_path().display());
            }
            DescriptorAction::SetPort {
                container_port,
                host_port,
                protocol,
                address,
            } => {
                let mut descriptor = manager.ensure_descriptor().await?;
                let mut mapper = PortMapper::from_descriptor(&descriptor);
                mapper
                    .set_fixed_binding_checked(
                        *container_port,
                        *host_port,
                        SetBindingOptions {
                            protocol: *protocol,
                            host_address: address.clone(),
                        },
                    )
                    .await?;
                mapper.write_into(&mut descriptor);
                manager.write_descriptor(&descriptor).await?;
                println!("{}/{} -> {}", container_port, protocol, host_port);
                if manager.status().await.is_running() {
                    println!("run `winboat up` to apply the change");
                }
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", ctx.config.get().to_json_pretty()?);
            }
            ConfigAction::SetRuntime { kind } => {
                let caps = resolve(*kind, &ctx.host, &ctx.flags);
                if let Some(reason) = caps.unsupported_reason {
                    anyhow::bail!("{}", reason);
                }
                let kind = *kind;
                ctx.config.update(|c| c.runtime_kind = kind)?;
                println!("runtime set to {}", kind);
            }
        },
        Commands::Qmp { command, args } => {
            let arguments = match args {
                Some(text) => Some(
                    serde_json::from_str::<serde_json::Value>(text)
                        .context("arguments must be a JSON object")?,
                ),
                None => None,
            };
            let client = ctx.qmp_session().await?;
            let reply = client.execute_command(command, arguments).await;
            client.close().await;
            println!("{}", serde_json::to_string_pretty(&reply?)?);
        }
        Commands::Guest { action } => {
            let guest = ctx.guest_client().await?;
            match action {
                GuestAction::Health => {
                    let ok = guest.health().await;
                    println!("{}", if ok { "healthy" } else { "unreachable" });
                }
                GuestAction::Version => {
                    let v = guest.version().await?;
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
                GuestAction::Metrics => {
                    let m = guest.metrics().await?;
                    println!("{}", serde_json::to_string_pretty(&m)?);
                }
                GuestAction::Rdp => {
                    println!("rdpConnected: {}", guest.rdp_connected().await?);
                }
                GuestAction::Apps => {
                    println!("{}", serde_json::to_string_pretty(&guest.apps().await?)?);
                }
            }
        }
        Commands::Usb { action } => {
            if !ctx.capabilities.supports_usb_passthrough {
                anyhow::bail!("{} does not support USB passthrough", ctx.kind());
            }
            let (device_str, attach) = match action {
                UsbAction::Attach { device } => (device, true),
                UsbAction::Detach { device } => (device, false),
            };
            let (vendor, product, device) = parse_usb_id(device_str)?;
            let client = ctx.qmp_session().await?;
            let result = if attach {
                client
                    .device_add_usb_host(&device.device_id(), vendor, product)
                    .await
            } else {
                client.device_del(&device.device_id()).await
            };
            client.close().await;
            result?;

            ctx.config.update(|c| {
                let list = &mut c.customizations.passed_through_devices;
                list.retain(|d| d.device_id() != device.device_id());
                if attach {
                    list.push(device.clone());
                }
            })?;
            println!(
                "{} {}",
                if attach { "attached" } else { "detached" },
                device.device_id()
            );
        }
        Commands::Supervise => {
            let handle = InstanceSupervisor::new(manager.clone(), &ctx.capabilities).spawn();
            let mut rx = handle.snapshots();
            info!("supervising {} (Ctrl-C to stop)", manager.name());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snap = rx.borrow_and_update().clone();
                        print_snapshot(&snap);
                    }
                }
            }
            handle.shutdown().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_up_passes_trailing_args() {
        let cli = Cli::parse_from(["winboat", "up", "--", "--pull", "always"]);
        match cli.command {
            Commands::Up { extra } => assert_eq!(extra, vec!["--pull", "always"]),
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn test_set_runtime_parses_kind() {
        let cli = Cli::parse_from(["winboat", "--data-dir", "/tmp/x", "config", "set-runtime", "qemu"]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::SetRuntime {
                    kind: RuntimeKind::Qemu
                }
            }
        ));
    }

    #[test]
    fn test_parse_usb_id() {
        let (v, p, d) = parse_usb_id("046D:0xC52B").unwrap();
        assert_eq!((v, p), (0x046d, 0xc52b));
        assert_eq!(d.device_id(), "usb-046d-c52b");
        assert!(parse_usb_id("046d").is_err());
        assert!(parse_usb_id("zz:01").is_err());
    }
}
