//! Install media catalog
//!
//! Turns a user-facing media key into a concrete [`InstallMedia`]
//! descriptor: either a short alias like `opensuse12.1` or `sles11sp1`
//! matched against an ordered rule table, or a raw locator whose
//! distribution family is sniffed from the URL text and, failing that,
//! probed over the wire. Resolution is strict: a key nothing recognizes
//! is a hard [`MediaError::UnknownMedia`], never a guessed default.

use regex::{Captures, Regex, RegexBuilder};
use tracing::debug;

use crate::profile::{InstallProfile, ProfileKind};
use crate::vfs::{HttpFs, MediaError, VirtualFilesystem};

/// Distribution family, which decides installer paths and the answer
/// file dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFamily {
    Suse,
    Fedora,
    Debian,
}

impl MediaFamily {
    pub fn profile_kind(self) -> ProfileKind {
        match self {
            MediaFamily::Suse => ProfileKind::AutoYast,
            MediaFamily::Fedora => ProfileKind::Kickstart,
            MediaFamily::Debian => ProfileKind::Preseed,
        }
    }

    fn kernel_path(self) -> String {
        match self {
            MediaFamily::Suse => format!("/boot/{}/loader/linux", host_arch()),
            MediaFamily::Fedora => "/images/pxeboot/vmlinuz".to_string(),
            MediaFamily::Debian => format!(
                "/main/installer-{}/current/images/netboot/debian-installer/{}/linux",
                debian_arch(),
                debian_arch()
            ),
        }
    }

    fn initrd_path(self) -> String {
        match self {
            MediaFamily::Suse => format!("/boot/{}/loader/initrd", host_arch()),
            MediaFamily::Fedora => "/images/pxeboot/initrd.img".to_string(),
            MediaFamily::Debian => format!(
                "/main/installer-{}/current/images/netboot/debian-installer/{}/initrd.gz",
                debian_arch(),
                debian_arch()
            ),
        }
    }
}

fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Debian spells its architectures differently.
fn debian_arch() -> &'static str {
    match host_arch() {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Resolved install media: where the tree lives and where the installer
/// kernel and initrd sit inside it.
#[derive(Debug, Clone)]
pub struct InstallMedia {
    pub family: MediaFamily,
    pub location: String,
    pub kernel_path: String,
    pub initrd_path: String,
}

impl InstallMedia {
    pub fn new(family: MediaFamily, location: impl Into<String>) -> Self {
        Self {
            family,
            location: location.into(),
            kernel_path: family.kernel_path(),
            initrd_path: family.initrd_path(),
        }
    }

    /// A fresh profile of the dialect this media installs with.
    pub fn profile(&self) -> InstallProfile {
        InstallProfile::new(self.family.profile_kind())
    }
}

struct AliasRule {
    pattern: Regex,
    family: MediaFamily,
    template: &'static str,
}

impl AliasRule {
    fn new(pattern: &str, family: MediaFamily, template: &'static str) -> Self {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .unwrap();
        Self {
            pattern,
            family,
            template,
        }
    }

    /// Fill the URL template from the named captures plus the host
    /// architecture.
    fn expand(&self, captures: &Captures) -> String {
        let mut url = self.template.replace("{arch}", host_arch());
        for name in self.pattern.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                url = url.replace(&format!("{{{name}}}"), m.as_str());
            }
        }
        url
    }
}

/// Ordered alias table plus raw-URL family detection.
pub struct InstallMediaCatalog<'a> {
    rules: Vec<AliasRule>,
    vfs: &'a VirtualFilesystem,
}

impl<'a> InstallMediaCatalog<'a> {
    pub fn new(vfs: &'a VirtualFilesystem) -> Self {
        // First match wins, so the more specific service-pack rule has
        // to sit in front of the plain SLES one.
        let rules = vec![
            AliasRule::new(
                r"^opensuse[ _-]?(?P<version>\d+\.\d+)$",
                MediaFamily::Suse,
                "http://download.opensuse.org/distribution/{version}/repo/oss/",
            ),
            AliasRule::new(
                r"^(?:opensuse[ _-]?)?factory$",
                MediaFamily::Suse,
                "http://download.opensuse.org/factory/repo/oss/",
            ),
            AliasRule::new(
                r"^sles[ _-]?(?P<version>\d+)[ _-]?sp(?P<sp>\d+)$",
                MediaFamily::Suse,
                "http://download.suse.de/install/SLES-{version}-SP{sp}-GM/{arch}/DVD1/",
            ),
            AliasRule::new(
                r"^sles[ _-]?(?P<version>\d+)$",
                MediaFamily::Suse,
                "http://download.suse.de/install/SLES-{version}-GM/{arch}/DVD1/",
            ),
            AliasRule::new(
                r"^sled[ _-]?(?P<version>\d+)[ _-]?sp(?P<sp>\d+)$",
                MediaFamily::Suse,
                "http://download.suse.de/install/SLED-{version}-SP{sp}-GM/{arch}/DVD1/",
            ),
            AliasRule::new(
                r"^sled[ _-]?(?P<version>\d+)$",
                MediaFamily::Suse,
                "http://download.suse.de/install/SLED-{version}-GM/{arch}/DVD1/",
            ),
            AliasRule::new(
                r"^fedora[ _-]?(?P<version>\d+)$",
                MediaFamily::Fedora,
                "http://download.fedoraproject.org/pub/fedora/linux/releases/{version}/Fedora/{arch}/os/",
            ),
            AliasRule::new(
                r"^debian[ _-]?(?P<version>[a-z]+)$",
                MediaFamily::Debian,
                "http://cdn.debian.net/debian/dists/{version}",
            ),
        ];
        Self { rules, vfs }
    }

    /// Resolve a media key: alias table first, then raw locators.
    pub fn resolve(&self, key: &str) -> Result<InstallMedia, MediaError> {
        for rule in &self.rules {
            if let Some(captures) = rule.pattern.captures(key.trim()) {
                let location = rule.expand(&captures);
                debug!("media alias {key:?} resolved to {location}");
                return Ok(InstallMedia::new(rule.family, location));
            }
        }
        self.resolve_locator(key)
    }

    fn resolve_locator(&self, locator: &str) -> Result<InstallMedia, MediaError> {
        if let Some(family) = detect_family(locator) {
            return Ok(InstallMedia::new(family, locator));
        }
        if HttpFs::accepts(locator) {
            // An anonymous mirror that serves /content is a SUSE repo.
            debug!("probing {locator} for a /content file");
            if self.vfs.open(locator, "/content").is_ok() {
                return Ok(InstallMedia::new(MediaFamily::Suse, locator));
            }
        }
        Err(MediaError::UnknownMedia(locator.to_string()))
    }
}

/// Guess the family from the locator text alone.
fn detect_family(locator: &str) -> Option<MediaFamily> {
    let lower = locator.to_lowercase();
    if lower.contains("suse") {
        Some(MediaFamily::Suse)
    } else if ["fedora", "redhat", "centos"]
        .iter()
        .any(|k| lower.contains(k))
    {
        Some(MediaFamily::Fedora)
    } else if lower.contains("debian") {
        Some(MediaFamily::Debian)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hostexec::testutil::RecordingExec;
    use crate::vfs::testhttp;

    fn catalog_vfs() -> VirtualFilesystem {
        VirtualFilesystem::new(Arc::new(RecordingExec::new()))
    }

    #[test]
    fn test_opensuse_aliases() {
        let vfs = catalog_vfs();
        let catalog = InstallMediaCatalog::new(&vfs);

        let media = catalog.resolve("opensuse12.1").unwrap();
        assert_eq!(media.family, MediaFamily::Suse);
        assert_eq!(
            media.location,
            "http://download.opensuse.org/distribution/12.1/repo/oss/"
        );

        let media = catalog.resolve("Factory").unwrap();
        assert_eq!(
            media.location,
            "http://download.opensuse.org/factory/repo/oss/"
        );
    }

    #[test]
    fn test_sle_aliases_substitute_arch() {
        let vfs = catalog_vfs();
        let catalog = InstallMediaCatalog::new(&vfs);
        let arch = std::env::consts::ARCH;

        let media = catalog.resolve("sles11").unwrap();
        assert_eq!(
            media.location,
            format!("http://download.suse.de/install/SLES-11-GM/{arch}/DVD1/")
        );

        let media = catalog.resolve("sles11sp1").unwrap();
        assert_eq!(
            media.location,
            format!("http://download.suse.de/install/SLES-11-SP1-GM/{arch}/DVD1/")
        );
    }

    #[test]
    fn test_fedora_and_debian_aliases() {
        let vfs = catalog_vfs();
        let catalog = InstallMediaCatalog::new(&vfs);
        let arch = std::env::consts::ARCH;

        let media = catalog.resolve("fedora17").unwrap();
        assert_eq!(media.family, MediaFamily::Fedora);
        assert_eq!(
            media.location,
            format!(
                "http://download.fedoraproject.org/pub/fedora/linux/releases/17/Fedora/{arch}/os/"
            )
        );

        let media = catalog.resolve("debian wheezy").unwrap();
        assert_eq!(media.family, MediaFamily::Debian);
        assert_eq!(media.location, "http://cdn.debian.net/debian/dists/wheezy");
    }

    #[test]
    fn test_raw_url_family_from_text() {
        let vfs = catalog_vfs();
        let catalog = InstallMediaCatalog::new(&vfs);

        let media = catalog
            .resolve("http://mirror.example.com/opensuse/12.2/repo/oss/")
            .unwrap();
        assert_eq!(media.family, MediaFamily::Suse);

        let media = catalog
            .resolve("http://mirror.example.com/fedora/releases/17/")
            .unwrap();
        assert_eq!(media.family, MediaFamily::Fedora);
    }

    #[test]
    fn test_anonymous_url_probed_for_content_file() {
        let base = testhttp::serve(vec![("/content", 200, "PRODUCT foo\n")]);
        let vfs = catalog_vfs();
        let catalog = InstallMediaCatalog::new(&vfs);

        let media = catalog.resolve(&base).unwrap();
        assert_eq!(media.family, MediaFamily::Suse);
        assert_eq!(media.location, base);
    }

    #[test]
    fn test_unknown_media_is_an_error() {
        let base = testhttp::serve(vec![("/content", 404, "gone")]);
        let vfs = catalog_vfs();
        let catalog = InstallMediaCatalog::new(&vfs);

        assert!(matches!(
            catalog.resolve("plan9"),
            Err(MediaError::UnknownMedia(_))
        ));
        assert!(matches!(
            catalog.resolve(&base),
            Err(MediaError::UnknownMedia(_))
        ));
    }

    #[test]
    fn test_installer_paths_per_family() {
        let arch = std::env::consts::ARCH;
        let media = InstallMedia::new(MediaFamily::Suse, "http://example.com/");
        assert_eq!(media.kernel_path, format!("/boot/{arch}/loader/linux"));
        assert_eq!(media.initrd_path, format!("/boot/{arch}/loader/initrd"));

        let media = InstallMedia::new(MediaFamily::Fedora, "http://example.com/");
        assert_eq!(media.kernel_path, "/images/pxeboot/vmlinuz");

        let media = InstallMedia::new(MediaFamily::Debian, "http://example.com/");
        assert!(media.kernel_path.contains("/images/netboot/debian-installer/"));
    }
}
