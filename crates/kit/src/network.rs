//! Bridged NAT networking shared between virtual machines
//!
//! A [`BridgedNetwork`] is a [`Resource`]: the bridge, the NAT rule and
//! the dnsmasq helper are created by whichever process first acquires
//! the network and removed by the last one out. Tap attachment is per
//! VM and deliberately independent of that refcount: every boot
//! connects its own interface through the hypervisor's interface hooks
//! while all of them share one bridge lifecycle.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use ipnetwork::Ipv4Network;
use tracing::info;

use crate::arbiter::{lock_dir, Resource};
use crate::hostexec::HostExec;

/// Subnet used when the workspace does not configure one.
pub const DEFAULT_SUBNET: &str = "192.168.58.254/24";

/// Bridge device shared by all workspace VMs.
pub const BRIDGE_DEVICE: &str = "br0";

/// Bridge with NAT to the host interface and DHCP/DNS service.
pub struct BridgedNetwork {
    subnet: Ipv4Network,
    name: String,
    run_dir: PathBuf,
    exec: Arc<dyn HostExec>,
}

impl std::fmt::Debug for BridgedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedNetwork")
            .field("subnet", &self.subnet)
            .field("name", &self.name)
            .finish()
    }
}

impl std::fmt::Display for BridgedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", BRIDGE_DEVICE, self.subnet.network(), self.subnet.prefix())
    }
}

impl BridgedNetwork {
    /// Create a network for the given CIDR subnet, e.g.
    /// `192.168.58.254/24`. Networks over the same subnet share one
    /// resource identity regardless of the host address given.
    pub fn new(run_dir: PathBuf, exec: Arc<dyn HostExec>, cidr: &str) -> Result<Self> {
        let subnet: Ipv4Network = cidr
            .parse()
            .wrap_err_with(|| format!("invalid network address {cidr:?}"))?;
        // Gateway plus at least one DHCP lease besides the broadcast
        // address.
        if subnet.size() < 4 {
            return Err(eyre!("subnet {cidr:?} is too small to host a DHCP range"));
        }
        let name = format!("{}-{}", BRIDGE_DEVICE, u32::from(subnet.network()));
        Ok(Self {
            subnet,
            name,
            run_dir,
            exec,
        })
    }

    /// The default bridged network.
    pub fn default_network(run_dir: PathBuf, exec: Arc<dyn HostExec>) -> Result<Self> {
        Self::new(run_dir, exec, DEFAULT_SUBNET)
    }

    fn subnet_str(&self) -> String {
        format!("{}/{}", self.subnet.network(), self.subnet.prefix())
    }

    fn host(&self, n: u32) -> Result<Ipv4Addr> {
        self.subnet
            .nth(n)
            .ok_or_else(|| eyre!("subnet {} has no host address {n}", self.subnet_str()))
    }

    fn gateway(&self) -> Result<Ipv4Addr> {
        self.host(1)
    }

    fn last_host(&self) -> Result<Ipv4Addr> {
        let n = self
            .subnet
            .size()
            .checked_sub(2)
            .ok_or_else(|| eyre!("subnet {} too small", self.subnet_str()))?;
        self.host(n)
    }

    fn dnsmasq_pidfile(&self) -> PathBuf {
        lock_dir(&self.run_dir, self.class(), &self.name).join("dnsmasq.pid")
    }

    fn dnsmasq_pid(&self) -> Result<u32> {
        let path = self.dnsmasq_pidfile();
        let raw = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading dnsmasq pidfile {}", path.display()))?;
        raw.trim()
            .parse()
            .wrap_err_with(|| format!("bad dnsmasq pid {raw:?}"))
    }

    fn start_dnsmasq(&self) -> Result<()> {
        let pidfile = self.dnsmasq_pidfile();
        let listen = self.gateway()?.to_string();
        let range = format!("{},{}", self.host(2)?, self.last_host()?);
        self.exec.spawn_detached(&[
            "dnsmasq",
            "-Z",
            "-x",
            pidfile.to_str().ok_or_else(|| eyre!("non-utf8 run dir"))?,
            "--strict-order",
            "--bind-interfaces",
            "--listen-address",
            &listen,
            "--dhcp-range",
            &range,
        ])?;
        Ok(())
    }

    /// Attach a guest tap device to the bridge. Called once per VM boot
    /// by the hypervisor's interface-up hook, not by the arbiter.
    pub fn connect_interface(&self, device: &str) -> Result<()> {
        info!("connecting {device} --> {BRIDGE_DEVICE}");
        self.exec.run(&["brctl", "addif", BRIDGE_DEVICE, device])?;
        Ok(())
    }

    /// Detach a guest tap device from the bridge.
    pub fn disconnect_interface(&self, device: &str) -> Result<()> {
        info!("disconnecting {device} -X-> {BRIDGE_DEVICE}");
        self.exec.run(&["brctl", "delif", BRIDGE_DEVICE, device])?;
        Ok(())
    }
}

impl Resource for BridgedNetwork {
    fn class(&self) -> &'static str {
        "network"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn on_up(&self) -> Result<()> {
        let exec = &self.exec;
        let subnet = self.subnet_str();
        info!("bringing up bridged network {subnet} on {BRIDGE_DEVICE}");

        exec.run(&["brctl", "addbr", BRIDGE_DEVICE])?;
        exec.write_file(
            &PathBuf::from(format!(
                "/proc/sys/net/ipv6/conf/{BRIDGE_DEVICE}/disable_ipv6"
            )),
            "1",
        )?;
        exec.write_file(&PathBuf::from("/proc/sys/net/ipv4/ip_forward"), "1")?;
        exec.run(&["brctl", "stp", BRIDGE_DEVICE, "on"])?;

        let addr = format!("{}/{}", self.gateway()?, self.subnet.prefix());
        exec.run(&["ip", "addr", "add", &addr, "dev", BRIDGE_DEVICE])?;
        exec.run(&["ip", "link", "set", BRIDGE_DEVICE, "up"])?;
        // Masquerade everything leaving the subnet, but not guest to
        // guest traffic.
        exec.run(&[
            "iptables", "-t", "nat", "-A", "POSTROUTING", "-s", &subnet, "!", "-d", &subnet,
            "-j", "MASQUERADE",
        ])?;

        self.start_dnsmasq()
    }

    fn on_down(&self) -> Result<()> {
        let exec = &self.exec;
        let subnet = self.subnet_str();
        info!("bringing down bridged network {subnet} on {BRIDGE_DEVICE}");

        let pid = self.dnsmasq_pid()?;
        info!("terminating dnsmasq ({pid})");
        exec.kill(pid)?;
        exec.run(&[
            "iptables", "-t", "nat", "-D", "POSTROUTING", "-s", &subnet, "!", "-d", &subnet,
            "-j", "MASQUERADE",
        ])?;
        exec.run(&["ip", "link", "set", BRIDGE_DEVICE, "down"])?;
        exec.run(&["brctl", "delbr", BRIDGE_DEVICE])?;
        Ok(())
    }

    fn on_acquire(&self) -> Result<()> {
        // Only bridge-level up/down matters for this resource type.
        Ok(())
    }

    fn on_release(&self) -> Result<()> {
        Ok(())
    }
}
