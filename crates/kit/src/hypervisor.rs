//! Hypervisor driver for booting workspace VMs
//!
//! The [`HypervisorDriver`] trait is the seam the bootstrap flow talks
//! through; [`VirshDriver`] is the real implementation, driving a
//! transient libvirt domain through `virsh` with generated domain XML.

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use color_eyre::eyre::{self, eyre, Context};
use color_eyre::Result;
use tracing::{debug, info, instrument};

use crate::hostexec::{ExecError, HostExec};

/// Libvirt connection used for bridged networking.
pub const CONNECTION: &str = "qemu:///system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Running,
    Paused,
    Stopped,
    Other(String),
}

impl FromStr for VmState {
    type Err = eyre::Report;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "running" => Ok(VmState::Running),
            "paused" => Ok(VmState::Paused),
            "shut off" => Ok(VmState::Stopped),
            other => Ok(VmState::Other(other.to_string())),
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Stopped => write!(f, "shut off"),
            VmState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Everything one boot needs. Per-boot overrides (installer kernel,
/// floppy, extra command line) sit next to the workspace identity so a
/// stage can be described in one place.
#[derive(Debug, Clone, Default)]
pub struct BootOptions {
    pub name: String,
    pub uuid: String,
    pub mac_address: String,
    pub memory_mb: u64,
    pub disk: PathBuf,
    /// Direct-boot kernel override; the disk bootloader runs when unset.
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub cmdline: Vec<String>,
    pub cdrom: Option<PathBuf>,
    /// Host directory exposed to the guest as a FAT floppy.
    pub floppy_dir: Option<PathBuf>,
    /// When false the domain is destroyed on guest reboot, which turns
    /// an installer-initiated reboot into a clean stop.
    pub reboot: bool,
}

/// Boot lifecycle seam between the bootstrap flow and libvirt.
pub trait HypervisorDriver: Send + Sync {
    fn start(&self, options: &BootOptions) -> Result<()>;
    /// Graceful ACPI shutdown request.
    fn shutdown(&self) -> Result<()>;
    /// Immediate stop.
    fn destroy(&self) -> Result<()>;
    fn state(&self) -> Result<VmState>;
}

/// Builder for the transient domain XML.
#[derive(Debug, Default)]
pub struct DomainBuilder {
    options: BootOptions,
    bridge: Option<String>,
}

impl DomainBuilder {
    pub fn new(options: &BootOptions) -> Self {
        Self {
            options: options.clone(),
            bridge: None,
        }
    }

    /// Attach the interface to a host bridge instead of the libvirt
    /// default network.
    pub fn with_bridge(mut self, bridge: &str) -> Self {
        self.bridge = Some(bridge.to_string());
        self
    }

    pub fn build_xml(self) -> Result<String> {
        let o = &self.options;
        if o.name.is_empty() {
            return Err(eyre!("domain name is required"));
        }
        if o.disk.as_os_str().is_empty() {
            return Err(eyre!("domain disk is required"));
        }

        let mut xml = format!(
            r#"<domain type="kvm">
  <name>{}</name>
  <uuid>{}</uuid>
  <memory unit="MiB">{}</memory>
  <currentMemory unit="MiB">{}</currentMemory>
  <vcpu>1</vcpu>
  <os>
    <type arch="{}">hvm</type>"#,
            o.name,
            o.uuid,
            o.memory_mb,
            o.memory_mb,
            std::env::consts::ARCH
        );

        // Direct boot bypasses the disk bootloader during install.
        if let Some(ref kernel) = o.kernel {
            xml.push_str(&format!("\n    <kernel>{}</kernel>", kernel.display()));
        }
        if let Some(ref initrd) = o.initrd {
            xml.push_str(&format!("\n    <initrd>{}</initrd>", initrd.display()));
        }
        if !o.cmdline.is_empty() {
            xml.push_str(&format!("\n    <cmdline>{}</cmdline>", o.cmdline.join(" ")));
        }
        xml.push_str("\n    <boot dev=\"hd\"/>\n  </os>");

        let on_reboot = if o.reboot { "restart" } else { "destroy" };
        xml.push_str(&format!(
            r#"
  <features>
    <acpi/>
    <apic/>
  </features>
  <clock offset="utc"/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>{}</on_reboot>
  <on_crash>destroy</on_crash>"#,
            on_reboot
        ));

        xml.push_str("\n  <devices>");
        xml.push_str(&format!(
            r#"
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2"/>
      <source file="{}"/>
      <target dev="sda" bus="virtio"/>
    </disk>"#,
            o.disk.display()
        ));

        if let Some(ref dir) = o.floppy_dir {
            xml.push_str(&format!(
                r#"
    <disk type="dir" device="floppy">
      <driver name="qemu" type="fat"/>
      <source dir="{}"/>
      <target dev="fda"/>
      <readonly/>
    </disk>"#,
                dir.display()
            ));
        }

        if let Some(ref iso) = o.cdrom {
            xml.push_str(&format!(
                r#"
    <disk type="file" device="cdrom">
      <driver name="qemu" type="raw"/>
      <source file="{}"/>
      <target dev="hdc" bus="ide"/>
      <readonly/>
    </disk>"#,
                iso.display()
            ));
        }

        match self.bridge {
            Some(ref bridge) => xml.push_str(&format!(
                r#"
    <interface type="bridge">
      <source bridge="{}"/>
      <mac address="{}"/>
      <model type="virtio"/>
    </interface>"#,
                bridge, o.mac_address
            )),
            None => xml.push_str(&format!(
                r#"
    <interface type="network">
      <source network="default"/>
      <mac address="{}"/>
      <model type="virtio"/>
    </interface>"#,
                o.mac_address
            )),
        }

        xml.push_str(
            r#"
    <serial type="pty">
      <target port="0"/>
    </serial>
    <console type="pty">
      <target type="serial" port="0"/>
    </console>
    <graphics type="vnc" port="-1" autoport="yes"/>
    <graphics type="spice" autoport="yes"/>
  </devices>
</domain>"#,
        );

        Ok(xml)
    }
}

/// Drives a transient domain through the `virsh` command line tool.
pub struct VirshDriver {
    name: String,
    exec: Arc<dyn HostExec>,
    bridge: Option<String>,
}

impl VirshDriver {
    pub fn new(name: impl Into<String>, exec: Arc<dyn HostExec>) -> Self {
        Self {
            name: name.into(),
            exec,
            bridge: None,
        }
    }

    pub fn with_bridge(mut self, bridge: &str) -> Self {
        self.bridge = Some(bridge.to_string());
        self
    }

    fn virsh(&self, args: &[&str]) -> Result<(), ExecError> {
        let mut argv = vec!["virsh", "-c", CONNECTION];
        argv.extend_from_slice(args);
        self.exec.run(&argv)
    }
}

impl HypervisorDriver for VirshDriver {
    #[instrument(skip_all, fields(name = %self.name))]
    fn start(&self, options: &BootOptions) -> Result<()> {
        let mut builder = DomainBuilder::new(options);
        if let Some(ref bridge) = self.bridge {
            builder = builder.with_bridge(bridge);
        }
        let xml = builder.build_xml()?;
        debug!("domain xml:\n{xml}");

        let mut file = tempfile::Builder::new()
            .prefix("vmkit-domain-")
            .suffix(".xml")
            .tempfile()
            .wrap_err("creating domain xml file")?;
        file.write_all(xml.as_bytes())
            .wrap_err("writing domain xml")?;
        file.flush().wrap_err("writing domain xml")?;

        let path = file
            .path()
            .to_str()
            .ok_or_else(|| eyre!("non-utf8 temp path"))?;
        info!("creating transient domain {}", self.name);
        self.virsh(&["create", path])
            .wrap_err_with(|| format!("creating domain {}", self.name))?;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.virsh(&["shutdown", &self.name])
            .wrap_err_with(|| format!("shutting down {}", self.name))?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.virsh(&["destroy", &self.name])
            .wrap_err_with(|| format!("destroying {}", self.name))?;
        Ok(())
    }

    fn state(&self) -> Result<VmState> {
        let argv = ["virsh", "-c", CONNECTION, "domstate", &self.name];
        match self.exec.run_get_string(&argv) {
            Ok(out) => Ok(VmState::from_str(&out)?),
            // A transient domain vanishes once it powers off, so a
            // lookup failure is a normal stopped state.
            Err(ExecError::Status { .. }) => Ok(VmState::Stopped),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BootOptions {
        BootOptions {
            name: "test_vm".to_string(),
            uuid: "f47ac10b-58cc-4372-a567-0e02b2c3d479".to_string(),
            mac_address: "52:54:00:12:34:56".to_string(),
            memory_mb: 1024,
            disk: PathBuf::from("/work/base.qcow2"),
            ..Default::default()
        }
    }

    #[test]
    fn test_vm_state_round_trip() {
        assert_eq!(VmState::from_str("running").unwrap(), VmState::Running);
        assert_eq!(VmState::from_str("shut off\n").unwrap(), VmState::Stopped);
        assert_eq!(
            VmState::from_str("pmsuspended").unwrap(),
            VmState::Other("pmsuspended".to_string())
        );
        assert_eq!(VmState::Stopped.to_string(), "shut off");
    }

    #[test]
    fn test_plain_boot_xml() {
        let xml = DomainBuilder::new(&options()).build_xml().unwrap();
        assert!(xml.contains("<name>test_vm</name>"));
        assert!(xml.contains("<memory unit=\"MiB\">1024</memory>"));
        assert!(xml.contains("<source file=\"/work/base.qcow2\"/>"));
        assert!(xml.contains("<mac address=\"52:54:00:12:34:56\"/>"));
        assert!(xml.contains("<on_reboot>destroy</on_reboot>"));
        assert!(!xml.contains("<kernel>"));
        assert!(!xml.contains("device=\"floppy\""));
    }

    #[test]
    fn test_install_boot_xml() {
        let mut o = options();
        o.kernel = Some(PathBuf::from("/tmp/linux"));
        o.initrd = Some(PathBuf::from("/tmp/initrd"));
        o.cmdline = vec![
            "install=http://example.com/oss/".to_string(),
            "autoyast=device://fd0/autoinst.xml".to_string(),
        ];
        o.floppy_dir = Some(PathBuf::from("/tmp/floppy"));
        let xml = DomainBuilder::new(&o).with_bridge("br0").build_xml().unwrap();

        assert!(xml.contains("<kernel>/tmp/linux</kernel>"));
        assert!(xml.contains("<initrd>/tmp/initrd</initrd>"));
        assert!(xml.contains(
            "<cmdline>install=http://example.com/oss/ autoyast=device://fd0/autoinst.xml</cmdline>"
        ));
        assert!(xml.contains("<source dir=\"/tmp/floppy\"/>"));
        assert!(xml.contains("<source bridge=\"br0\"/>"));
    }

    #[test]
    fn test_reboot_flag_controls_on_reboot() {
        let mut o = options();
        o.reboot = true;
        let xml = DomainBuilder::new(&o).build_xml().unwrap();
        assert!(xml.contains("<on_reboot>restart</on_reboot>"));
    }

    #[test]
    fn test_cdrom_attachment() {
        let mut o = options();
        o.cdrom = Some(PathBuf::from("/isos/install.iso"));
        let xml = DomainBuilder::new(&o).build_xml().unwrap();
        assert!(xml.contains("device=\"cdrom\""));
        assert!(xml.contains("<source file=\"/isos/install.iso\"/>"));
    }

    #[test]
    fn test_missing_name_is_an_error() {
        let o = BootOptions::default();
        assert!(DomainBuilder::new(&o).build_xml().is_err());
    }
}
