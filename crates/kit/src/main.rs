use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, Context};
use color_eyre::{Report, Result};
use regex::Regex;

mod arbiter;
mod bootstrap;
mod chain;
mod hostexec;
mod hypervisor;
mod media;
mod network;
mod profile;
mod vfs;
mod workspace;

use arbiter::{default_run_dir, with_resource};
use hostexec::{HostCommand, HostExec};
use network::{BridgedNetwork, BRIDGE_DEVICE};

/// Toolkit for bootstrapping and managing KVM virtual machines.
///
/// vmkit turns the current directory into a VM workspace: it installs a
/// distribution unattended into a copy-on-write disk chain and manages
/// snapshots of that chain afterwards.
#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Install a distribution into this workspace.
#[derive(Parser)]
struct BootstrapOpts {
    /// Media to install: an alias like `opensuse12.1` or `sles11sp1`,
    /// a repository URL, an ISO image or a local directory.
    location: String,

    /// Virtual size of the base disk image, e.g. `10G` or `4096M`.
    #[clap(long, short = 's', default_value = "10G")]
    disk_size: String,

    /// Extra packages to install: a comma separated list, or `@file`
    /// with one package per line.
    #[clap(long, short = 'p')]
    packages: Option<String>,
}

/// Manage the copy-on-write disk chain.
#[derive(Subcommand)]
enum DiskCommands {
    /// Append a snapshot on top of the current image
    Snapshot,
    /// Discard the newest snapshot
    Rollback,
    /// Print the image the next boot would use
    Current,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a distribution into this workspace
    Bootstrap(BootstrapOpts),

    /// Manage the copy-on-write disk chain
    #[clap(subcommand)]
    Disk(DiskCommands),

    /// qemu ifup hook: attach a tap device to the shared bridge
    #[clap(hide = true)]
    Ifup { device: String },

    /// qemu ifdown hook: detach a tap device from the shared bridge
    #[clap(hide = true)]
    Ifdown { device: String },
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting
/// to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn parse_packages(spec: Option<&str>) -> Result<Vec<String>> {
    let Some(spec) = spec else {
        return Ok(Vec::new());
    };
    if let Some(path) = spec.strip_prefix('@') {
        let raw =
            std::fs::read_to_string(path).wrap_err_with(|| format!("reading package list {path}"))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect())
    } else {
        Ok(spec
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn open_workspace(exec: Arc<dyn HostExec>) -> Result<workspace::Workspace> {
    let dir = std::env::current_dir().wrap_err("determining current directory")?;
    workspace::Workspace::open(dir, exec)
}

fn workspace_network(
    ws: &workspace::Workspace,
    exec: Arc<dyn HostExec>,
) -> Result<BridgedNetwork> {
    match ws.config.network.as_deref() {
        Some(cidr) => BridgedNetwork::new(default_run_dir(), exec, cidr),
        None => BridgedNetwork::default_network(default_run_dir(), exec),
    }
}

fn run_bootstrap(opts: BootstrapOpts) -> Result<()> {
    let size_re = Regex::new(r"^\d+[MG]$").unwrap();
    if !size_re.is_match(&opts.disk_size) {
        bail!("invalid disk size {:?} (expected e.g. 10G)", opts.disk_size);
    }
    let packages = parse_packages(opts.packages.as_deref())?;

    let exec: Arc<dyn HostExec> = Arc::new(HostCommand);
    let ws = open_workspace(exec.clone())?;
    ws.claim()?;
    let result = (|| {
        let vfs = vfs::VirtualFilesystem::new(exec.clone());
        let catalog = media::InstallMediaCatalog::new(&vfs);
        let media = catalog.resolve(&opts.location)?;

        let network = workspace_network(&ws, exec.clone())?;
        let driver =
            hypervisor::VirshDriver::new(ws.name(), exec.clone()).with_bridge(BRIDGE_DEVICE);

        let mut bootstrap =
            bootstrap::Bootstrap::new(&ws, &vfs, &driver, media, &opts.disk_size);
        for package in &packages {
            bootstrap.profile_mut().add_package(package);
        }

        // The bridge stays up for both boots and comes down afterwards
        // unless another VM still holds it.
        let cancel = AtomicBool::new(false);
        with_resource(&default_run_dir(), &network, || {
            bootstrap.run(&cancel)?;
            Ok(())
        })
    })();
    ws.release();
    result
}

fn run_disk(command: DiskCommands) -> Result<()> {
    let exec: Arc<dyn HostExec> = Arc::new(HostCommand);
    let ws = open_workspace(exec)?;
    match command {
        DiskCommands::Snapshot => {
            ws.claim()?;
            let result = ws.chain().shift();
            ws.release();
            println!("{}", result?.display());
        }
        DiskCommands::Rollback => {
            ws.claim()?;
            let result = ws.chain().rollback();
            ws.release();
            result?;
        }
        DiskCommands::Current => {
            println!("{}", ws.chain().current()?.display());
        }
    }
    Ok(())
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Bootstrap(opts) => run_bootstrap(opts)?,
        Commands::Disk(command) => run_disk(command)?,
        Commands::Ifup { device } => {
            let exec: Arc<dyn HostExec> = Arc::new(HostCommand);
            let ws = open_workspace(exec.clone())?;
            workspace_network(&ws, exec)?.connect_interface(&device)?;
        }
        Commands::Ifdown { device } => {
            let exec: Arc<dyn HostExec> = Arc::new(HostCommand);
            let ws = open_workspace(exec.clone())?;
            workspace_network(&ws, exec)?.disconnect_interface(&device)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_packages_inline_list() {
        assert_eq!(
            parse_packages(Some("vim, git,")).unwrap(),
            vec!["vim", "git"]
        );
        assert!(parse_packages(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_packages_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "vim\n# comment\n\ngit\n").unwrap();
        let spec = format!("@{}", file.path().display());
        assert_eq!(parse_packages(Some(&spec)).unwrap(), vec!["vim", "git"]);
    }
}
