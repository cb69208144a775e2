//! Unattended install orchestration
//!
//! Drives a workspace from an empty directory to an installed VM in two
//! boots. The install boot runs the distribution installer with a
//! direct-boot kernel, an answer file on a floppy and guest reboot
//! disabled, so the installer's final reboot stops the domain. The
//! finalize boot lets the freshly installed system come up once and run
//! its own second-stage configuration. Success seals the base image
//! behind the first snapshot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::chain::ChainError;
use crate::hypervisor::{HypervisorDriver, VmState};
use crate::media::InstallMedia;
use crate::profile::{InstallProfile, InstallSource};
use crate::vfs::{IsoFs, MediaError, MediaHandle, VirtualFilesystem};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    New,
    Installing,
    Finalizing,
    Done,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::New => "new",
            Stage::Installing => "install",
            Stage::Finalizing => "finalize",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Bootstrap failure, tagged with the stage that was running.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("{stage} stage failed: {source}")]
    Media {
        stage: Stage,
        #[source]
        source: MediaError,
    },
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        source: color_eyre::Report,
    },
    #[error("cancelled during the {stage} stage, domain destroyed")]
    Cancelled { stage: Stage },
}

/// One bootstrap run over a workspace.
pub struct Bootstrap<'a> {
    workspace: &'a Workspace,
    vfs: &'a VirtualFilesystem,
    driver: &'a dyn HypervisorDriver,
    media: InstallMedia,
    profile: InstallProfile,
    disk_size: String,
    stage: Stage,
    poll_interval: Duration,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        workspace: &'a Workspace,
        vfs: &'a VirtualFilesystem,
        driver: &'a dyn HypervisorDriver,
        media: InstallMedia,
        disk_size: impl Into<String>,
    ) -> Self {
        let profile = media.profile();
        Self {
            workspace,
            vfs,
            driver,
            media,
            profile,
            disk_size: disk_size.into(),
            stage: Stage::New,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The profile the install boot will be answered with.
    pub fn profile_mut(&mut self) -> &mut InstallProfile {
        &mut self.profile
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Run both stages. `cancel` is checked between state polls; a
    /// cancelled run destroys the domain and leaves the workspace in
    /// whatever disk state it reached.
    #[instrument(skip_all, fields(media = %self.media.location))]
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<(), InstallError> {
        self.workspace.chain().init(&self.disk_size)?;

        self.stage = Stage::Installing;
        if let Err(e) = self.install(cancel) {
            self.stage = Stage::Failed;
            return Err(e);
        }

        self.stage = Stage::Finalizing;
        if let Err(e) = self.finalize(cancel) {
            self.stage = Stage::Failed;
            return Err(e);
        }

        // Seal the freshly installed base behind the first snapshot.
        if let Err(e) = self.workspace.chain().shift() {
            self.stage = Stage::Failed;
            return Err(e.into());
        }
        self.stage = Stage::Done;
        info!("bootstrap finished");
        Ok(())
    }

    fn stage_err(&self, e: impl Into<color_eyre::Report>) -> InstallError {
        InstallError::Stage {
            stage: self.stage,
            source: e.into(),
        }
    }

    fn media_err(&self, source: MediaError) -> InstallError {
        InstallError::Media {
            stage: self.stage,
            source,
        }
    }

    fn install(&mut self, cancel: &AtomicBool) -> Result<(), InstallError> {
        info!(
            "installing {:?} from {}",
            self.media.family, self.media.location
        );
        let kernel = self
            .fetch(&self.media.kernel_path)
            .map_err(|e| self.media_err(e))?;
        let initrd = self
            .fetch(&self.media.initrd_path)
            .map_err(|e| self.media_err(e))?;

        let cdrom = iso_image(&self.media.location);
        let source = match &cdrom {
            Some(_) => InstallSource::Cdrom,
            None => InstallSource::Url(self.media.location.clone()),
        };
        self.profile.set_source(source);
        self.profile.set_reboot(false);

        let floppy = tempfile::Builder::new()
            .prefix("vmkit-floppy-")
            .tempdir()
            .map_err(|e| self.stage_err(e))?;
        let config_path = floppy.path().join(self.profile.config_filename());
        std::fs::write(&config_path, self.profile.render()).map_err(|e| self.stage_err(e))?;
        debug!("wrote {}", config_path.display());

        let mut options = self.workspace.boot_options().map_err(|e| self.stage_err(e))?;
        options.kernel = Some(kernel.path().to_owned());
        options.initrd = Some(initrd.path().to_owned());
        options.cmdline = self.profile.boot_args();
        options.floppy_dir = Some(floppy.path().to_owned());
        options.cdrom = cdrom;
        options.reboot = self.profile.reboot();

        self.driver
            .start(&options)
            .map_err(|e| self.stage_err(e))?;
        // The kernel, initrd and floppy handles stay alive until the
        // domain has stopped; the backing files vanish on return.
        self.wait_for_shutdown(cancel)
    }

    fn finalize(&mut self, cancel: &AtomicBool) -> Result<(), InstallError> {
        info!("booting the installed system for second stage setup");
        let mut options = self.workspace.boot_options().map_err(|e| self.stage_err(e))?;
        options.reboot = true;

        self.driver
            .start(&options)
            .map_err(|e| self.stage_err(e))?;
        self.wait_for_shutdown(cancel)
    }

    /// Poll until the domain stops. The domain is never left running
    /// on an error path: both cancellation and a failed state lookup
    /// destroy it before returning.
    fn wait_for_shutdown(&self, cancel: &AtomicBool) -> Result<(), InstallError> {
        loop {
            if cancel.load(Ordering::SeqCst) {
                info!("cancel requested, destroying domain");
                let _ = self.driver.destroy();
                return Err(InstallError::Cancelled { stage: self.stage });
            }
            match self.driver.state() {
                Ok(VmState::Stopped) => return Ok(()),
                Ok(state) => debug!("domain is {state}"),
                Err(e) => {
                    let _ = self.driver.destroy();
                    return Err(self.stage_err(e));
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn fetch(&self, path: &str) -> Result<MediaHandle, MediaError> {
        info!("fetching {}", path);
        let pb = ProgressBar::no_length();
        pb.set_style(ProgressStyle::default_bar());
        let report = |done: u64, total: u64| {
            pb.set_length(total);
            pb.set_position(done);
        };
        let handle = self
            .vfs
            .open_with_progress(&self.media.location, path, Some(&report))?;
        pb.finish_and_clear();
        Ok(handle)
    }
}

/// The attachable image path when the install location is an ISO.
fn iso_image(location: &str) -> Option<PathBuf> {
    if !IsoFs::accepts(location) {
        return None;
    }
    let path = location.strip_prefix("iso://").unwrap_or(location);
    let path = path.split('?').next().unwrap_or(path);
    Some(PathBuf::from(path))
}
