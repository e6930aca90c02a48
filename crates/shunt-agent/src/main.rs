//! Shunt agent.
//!
//! Thin wiring around the diversion core: it runs with elevated
//! privileges, opens the diversion device and logs what the classifier
//! diverts. The upstream side is an observe-mode sink; a full deployment
//! hands diverted packets to a user-space network stack instead.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use shunt_divert::packet::IpPacket;
use shunt_divert::{Device, DeviceConfig};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "debug"
    } else {
        "info,shunt_divert=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[derive(Debug, Clone, Default)]
struct AgentConfig {
    device: DeviceConfig,
    verbose: bool,
}

fn parse_args(args: &[String]) -> Result<AgentConfig> {
    let mut config = AgentConfig::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--filter" | "-f" => {
                i += 1;
                let value = args.get(i).context("--filter needs an expression")?;
                config.device.filter = value.clone();
            }
            "--divert-pid" | "-p" => {
                i += 1;
                let value = args.get(i).context("--divert-pid needs a pid")?;
                config
                    .device
                    .divert_pids
                    .push(value.parse().context("invalid pid")?);
            }
            "--divert-net" | "-n" => {
                i += 1;
                let value = args.get(i).context("--divert-net needs a CIDR network")?;
                config
                    .device
                    .divert_networks
                    .push(value.parse().context("invalid CIDR network")?);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                warn!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    Ok(config)
}

fn print_help() {
    println!("Shunt Agent - process-aware packet diversion");
    println!();
    println!("Usage: shunt-agent [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -f, --filter <expr>     Driver filter expression");
    println!("                          (default: \"outbound and (ip or ipv6)\")");
    println!("  -p, --divert-pid <pid>  Divert flows owned by this process id (repeatable)");
    println!("  -n, --divert-net <net>  Divert flows to this CIDR network (repeatable)");
    println!("  -v, --verbose           Verbose logging");
    println!("  -h, --help              Show this help message");
    println!();
    println!("This application requires Administrator privileges.");
}

#[cfg(windows)]
fn is_elevated() -> Result<bool> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
            .context("open process token")?;

        let mut elevation = TOKEN_ELEVATION::default();
        let mut returned = 0u32;
        GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
        .context("query token elevation")?;

        Ok(elevation.TokenIsElevated != 0)
    }
}

/// Observe-mode upstream sink: one IP packet per write, summarized at
/// debug level.
struct PacketLog;

impl io::Write for PacketLog {
    fn write(&mut self, packet: &[u8]) -> io::Result<usize> {
        match IpPacket::new(packet) {
            Ok(pkt) => debug!(
                proto = pkt.protocol(),
                src = %pkt.src_ip(),
                dst = %pkt.dst_ip(),
                len = pkt.total_len(),
                "diverted"
            ),
            Err(e) => debug!(error = %e, len = packet.len(), "diverted (unparsed)"),
        }
        Ok(packet.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args)?;
    init_logging(config.verbose);

    info!("Shunt agent starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(windows)]
    {
        if !is_elevated()? {
            error!("This application requires Administrator privileges");
            anyhow::bail!("Administrator privileges required");
        }
        info!("Running with Administrator privileges");
    }

    info!("Filter: {}", config.device.filter);
    info!("Divert pids: {:?}", config.device.divert_pids);
    info!("Divert networks: {:?}", config.device.divert_networks);

    let device = Arc::new(Device::new(config.device).context("create diversion device")?);
    let running = Arc::new(AtomicBool::new(true));

    {
        let device = Arc::clone(&device);
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            running.store(false, Ordering::SeqCst);
            if let Err(e) = device.close() {
                warn!(error = %e, "device close reported an error");
            }
        })
        .context("set ctrl-c handler")?;
    }

    let pipeline = {
        let device = Arc::clone(&device);
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("shunt-recv".into())
            .spawn(move || {
                let result = device.write_to(&mut PacketLog);
                running.store(false, Ordering::SeqCst);
                match result {
                    Ok(n) => info!(bytes = n, "receive pipeline finished"),
                    Err(e) => error!(error = %e, "receive pipeline failed"),
                }
            })
            .context("spawn receive pipeline thread")?
    };

    info!("Press Ctrl+C to stop");
    let mut ticks = 0u32;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        ticks += 1;
        if ticks % 5 == 0 {
            let snap = device.stats().snapshot();
            info!(
                "Stats: {} received, {} diverted, {} passed, {} flushed upstream",
                snap.received, snap.diverted, snap.passed, snap.flushed
            );
        }
    }

    device.close().context("close diversion device")?;
    let _ = pipeline.join();

    let snap = device.stats().snapshot();
    info!(
        "Final: {} received, {} diverted, {} passed, {} flushed upstream",
        snap.received, snap.diverted, snap.passed, snap.flushed
    );
    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_when_no_args() {
        let config = parse_args(&[]).unwrap();
        assert_eq!(config.device.filter, "outbound and (ip or ipv6)");
        assert!(config.device.divert_pids.is_empty());
        assert!(config.device.divert_networks.is_empty());
        assert!(!config.verbose);
    }

    #[test]
    fn test_parses_pids_and_networks() {
        let config = parse_args(&args(&[
            "--divert-pid",
            "1234",
            "-p",
            "5678",
            "--divert-net",
            "8.8.8.0/24",
            "-v",
        ]))
        .unwrap();

        assert_eq!(config.device.divert_pids, vec![1234, 5678]);
        assert_eq!(
            config.device.divert_networks,
            vec!["8.8.8.0/24".parse().unwrap()]
        );
        assert!(config.verbose);
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(parse_args(&args(&["--divert-pid", "abc"])).is_err());
        assert!(parse_args(&args(&["--divert-net", "not-a-net"])).is_err());
        assert!(parse_args(&args(&["--filter"])).is_err());
    }

    #[test]
    fn test_custom_filter_overrides_default() {
        let config = parse_args(&args(&["--filter", "outbound and tcp"])).unwrap();
        assert_eq!(config.device.filter, "outbound and tcp");
    }
}
