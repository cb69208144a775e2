//! Unattended install profile builders
//!
//! One mutable profile per bootstrap: callers append patterns, packages
//! and kernel arguments before the first boot, then [`InstallProfile::render`]
//! produces the answer file (AutoYaST XML, Kickstart script or debconf
//! preseed) as a pure function of that state.

use std::fmt::Write as _;

/// Root credential baked into every generated profile.
pub const ROOT_PASSWORD: &str = "linux";

/// Which answer-file dialect to render. Chosen once when the install
/// media descriptor is built, never swapped afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    AutoYast,
    Kickstart,
    Preseed,
}

/// Where the installer pulls its packages from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Url(String),
    Cdrom,
}

/// Mutable unattended-install state plus the rendering strategy.
#[derive(Debug, Clone)]
pub struct InstallProfile {
    kind: ProfileKind,
    patterns: Vec<String>,
    packages: Vec<String>,
    kernel_args: Vec<String>,
    source: InstallSource,
    reboot: bool,
}

impl InstallProfile {
    pub fn new(kind: ProfileKind) -> Self {
        let patterns = match kind {
            // SLE 10 needs at least a minimal pattern to be told apart
            // from an empty selection.
            ProfileKind::AutoYast => vec!["base".to_string()],
            _ => Vec::new(),
        };
        Self {
            kind,
            patterns,
            packages: Vec::new(),
            kernel_args: Vec::new(),
            source: InstallSource::Cdrom,
            reboot: false,
        }
    }

    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn add_pattern(&mut self, pattern: &str) {
        self.patterns.push(pattern.to_string());
    }

    pub fn add_package(&mut self, package: &str) {
        self.packages.push(package.to_string());
    }

    pub fn add_kernel_arg(&mut self, arg: &str) {
        self.kernel_args.push(arg.to_string());
    }

    pub fn set_source(&mut self, source: InstallSource) {
        self.source = source;
    }

    pub fn set_reboot(&mut self, reboot: bool) {
        self.reboot = reboot;
    }

    /// Whether the guest may survive its own reboot request.
    pub fn reboot(&self) -> bool {
        self.reboot
    }

    /// File name the installer expects on the floppy device.
    pub fn config_filename(&self) -> &'static str {
        match self.kind {
            ProfileKind::AutoYast => "autoinst.xml",
            ProfileKind::Kickstart => "ks.cfg",
            ProfileKind::Preseed => "preseed.cfg",
        }
    }

    /// Kernel command line for the installer boot: install source plus
    /// the pointer to the floppy-resident answer file, then whatever
    /// the caller appended.
    pub fn boot_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self.kind {
            ProfileKind::AutoYast => {
                match &self.source {
                    InstallSource::Url(url) => args.push(format!("install={url}")),
                    InstallSource::Cdrom => args.push("install=cd:/".to_string()),
                }
                args.push("autoyast=device://fd0/autoinst.xml".to_string());
            }
            ProfileKind::Kickstart => {
                args.push("ks=floppy".to_string());
                match &self.source {
                    InstallSource::Url(url) => args.push(format!("repo={url}")),
                    InstallSource::Cdrom => args.push("repo=cdrom".to_string()),
                }
            }
            ProfileKind::Preseed => {
                args.push("auto=true".to_string());
                args.push("preseed/file=/media/floppy/preseed.cfg".to_string());
            }
        }
        args.extend(self.kernel_args.iter().cloned());
        args
    }

    /// Render the answer file.
    pub fn render(&self) -> String {
        match self.kind {
            ProfileKind::AutoYast => self.render_autoyast(),
            ProfileKind::Kickstart => self.render_kickstart(),
            ProfileKind::Preseed => self.render_preseed(),
        }
    }

    fn render_autoyast(&self) -> String {
        let mut xml = String::from(
            r#"<?xml version="1.0"?>
<profile xmlns="http://www.suse.com/1.0/yast2ns" xmlns:config="http://www.suse.com/1.0/configns">
  <users config:type="list">
    <user>
      <username>root</username>
"#,
        );
        let _ = writeln!(xml, "      <user_password>{ROOT_PASSWORD}</user_password>");
        xml.push_str(
            r#"      <encrypted config:type="boolean">false</encrypted>
    </user>
  </users>
  <general>
    <mode>
      <confirm config:type="boolean">false</confirm>
      <final_reboot config:type="boolean">true</final_reboot>
      <second_stage config:type="boolean">true</second_stage>
    </mode>
  </general>
  <runlevel>
    <default>3</default>
    <services>
      <service>
        <service_name>sshd</service_name>
        <service_status>enable</service_status>
        <service_start>3 5</service_start>
        <service_stop>3 5</service_stop>
      </service>
    </services>
  </runlevel>
  <software>
    <patterns config:type="list">
"#,
        );
        for pattern in &self.patterns {
            let _ = writeln!(xml, "      <pattern>{pattern}</pattern>");
        }
        xml.push_str("    </patterns>\n    <packages config:type=\"list\">\n");
        for package in &self.packages {
            let _ = writeln!(xml, "      <package>{package}</package>");
        }
        xml.push_str(
            r#"    </packages>
  </software>
  <partitioning config:type="list">
    <drive>
      <use>all</use>
    </drive>
  </partitioning>
  <networking>
    <keep_install_network config:type="boolean">true</keep_install_network>
  </networking>
</profile>
"#,
        );
        xml
    }

    fn render_kickstart(&self) -> String {
        let mut ks = String::new();
        ks.push_str("cmdline\nhalt\n");
        let _ = writeln!(ks, "rootpw {ROOT_PASSWORD}");
        ks.push_str(
            "lang en_US.UTF-8\n\
             keyboard us\n\
             timezone --utc America/New_York\n\
             bootloader --location=mbr --driveorder=sda --append=\"rhgb quiet\"\n\
             install\n",
        );
        match &self.source {
            InstallSource::Url(url) => {
                let _ = writeln!(ks, "url --url={url}");
            }
            InstallSource::Cdrom => ks.push_str("cdrom\n"),
        }
        ks.push_str(
            "network --device eth0 --bootproto dhcp\n\
             zerombr yes\n\
             clearpart --all --initlabel\n\
             autopart\n\
             %packages --nobase\n\
             @core\n",
        );
        for package in &self.packages {
            let _ = writeln!(ks, "{package}");
        }
        ks.push_str("%end\n");
        ks
    }

    fn render_preseed(&self) -> String {
        let mut includes = vec!["ssh".to_string(), "rsync".to_string()];
        includes.extend(self.packages.iter().cloned());
        let mut txt = String::from(
            "d-i debian-installer/locale string en_US\n\
             d-i debian-installer/keymap string us\n\
             d-i netcfg/get_hostname string unassigned-hostname\n\
             d-i netcfg/get_hostname seen true\n\
             d-i netcfg/get_domain string unassigned-domain\n\
             d-i netcfg/get_domain seen true\n\
             d-i mirror/protocol string ftp\n\
             d-i mirror/ftp/hostname string ftp.de.debian.org\n\
             d-i mirror/ftp/directory string /debian/\n\
             d-i mirror/ftp/proxy string\n\
             \n\
             d-i partman-auto/method string regular\n\
             d-i partman-partitioning/confirm_write_new_label boolean true\n\
             d-i partman/choose_partition select finish\n\
             d-i partman/confirm boolean true\n\
             d-i partman/confirm_nooverwrite boolean true\n\
             \n\
             d-i clock-setup/utc boolean true\n\
             d-i time/zone string US/Eastern\n\
             d-i clock-setup/ntp boolean true\n\
             popularity-contest popularity-contest/participate boolean false\n",
        );
        let _ = writeln!(txt, "d-i pkgsel/include string {}", includes.join(" "));
        let _ = writeln!(txt, "d-i passwd/root-password password {ROOT_PASSWORD}");
        let _ = writeln!(txt, "d-i passwd/root-password-again password {ROOT_PASSWORD}");
        txt.push_str(
            "d-i passwd/make-user boolean false\n\
             d-i grub-installer/only_debian boolean true\n",
        );
        txt
    }
}
