//! Mount point allocation and the loop/verity/crypt mount stack for
//! bundle payloads, plus slot mount/umount tracking.
//!
//! Grounded on spec.md §4.5 and the teacher's own early-mount sequencing
//! style (`mount::early_mount`): idempotent directory creation, explicit
//! unwind-on-failure, invoking privileged tools through the same
//! subprocess `Runner` abstraction used for bootloader steering.

use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use pal::permissions::{DefaultAttributes, MountPointAttributes};
use tracing::{debug, warn};

use crate::bundle::crypt::CryptTarget;
use crate::bundle::verity::VerityTarget;
use crate::error::{Error, Result};
use crate::manifest::BundleFormat;
use crate::subprocess::Runner;

pub struct MountManager {
    prefix: PathBuf,
}

/// A bundle or slot mount currently held open; dropping this does not
/// itself unmount (explicit `teardown` is required so errors can be
/// reported), but it records what needs to be undone.
pub struct ActiveMount {
    pub mount_point: PathBuf,
    verity: Option<VerityTarget>,
    crypt: Option<CryptTarget>,
    loop_device: Option<String>,
}

impl MountManager {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        MountManager { prefix: prefix.into() }
    }

    fn point_for(&self, tag: &str) -> PathBuf {
        self.prefix.join(tag)
    }

    fn ensure_dir(path: &Path) -> Result<()> {
        match fs::create_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        let attrs = MountPointAttributes::get_file_attributes(path);
        fs::set_permissions(path, fs::Permissions::from_mode(attrs.mode)).map_err(Error::Io)?;
        chown(path, attrs.owner, attrs.group)?;
        Ok(())
    }

    /// Mounts a bundle's payload for reading, following the format's
    /// mount stack (loop-mount for PLAIN, verity(+crypt) device for
    /// VERITY/CRYPT). Unwinds anything already set up if a later step
    /// fails.
    pub fn mount_bundle(
        &self,
        runner: &dyn Runner,
        tag: &str,
        bundle_path: &str,
        payload_size: u64,
        format: BundleFormat,
        root_hash: Option<&[u8]>,
        crypt_key: Option<&[u8]>,
    ) -> Result<ActiveMount> {
        let mount_point = self.point_for(tag);
        Self::ensure_dir(&mount_point)?;

        let mut active = ActiveMount {
            mount_point: mount_point.clone(),
            verity: None,
            crypt: None,
            loop_device: None,
        };

        let result = (|| -> Result<()> {
            match format {
                BundleFormat::Plain => {
                    let loop_dev = attach_loop(runner, bundle_path, 0, payload_size)?;
                    active.loop_device = Some(loop_dev.clone());
                    do_mount(runner, &loop_dev, &mount_point, "squashfs", true)?;
                }
                BundleFormat::Verity | BundleFormat::Crypt => {
                    let root_hash = root_hash.ok_or_else(|| Error::Other("verity mount requires a root hash".to_string()))?;
                    let loop_dev = attach_loop(runner, bundle_path, 0, 0)?;
                    active.loop_device = Some(loop_dev.clone());

                    let data_blocks = payload_size / crate::bundle::verity::BLOCK_SIZE as u64;
                    let mut verity = VerityTarget::new(format!("slotupd-verity-{}", tag));
                    verity.setup(&loop_dev, &loop_dev, root_hash, data_blocks)?;
                    let verity_dev = format!("/dev/mapper/slotupd-verity-{}", tag);
                    active.verity = Some(verity);

                    let final_device = if format == BundleFormat::Crypt {
                        let key = crypt_key.ok_or_else(|| Error::Other("crypt mount requires a key".to_string()))?;
                        let mut crypt = CryptTarget::new(format!("slotupd-crypt-{}", tag));
                        crypt.setup(&verity_dev, key, data_blocks * 8)?;
                        active.crypt = Some(crypt);
                        format!("/dev/mapper/slotupd-crypt-{}", tag)
                    } else {
                        verity_dev
                    };

                    do_mount(runner, &final_device, &mount_point, "squashfs", true)?;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(active),
            Err(e) => {
                warn!(tag, error = %e, "bundle mount failed mid-setup, unwinding");
                let _ = self.teardown(runner, active);
                Err(e)
            }
        }
    }

    pub fn teardown(&self, runner: &dyn Runner, mut mount: ActiveMount) -> Result<()> {
        let _ = do_umount(runner, &mount.mount_point);
        if let Some(mut crypt) = mount.crypt.take() {
            crypt.remove(true)?;
        }
        if let Some(mut verity) = mount.verity.take() {
            verity.remove(true)?;
        }
        if let Some(dev) = mount.loop_device.take() {
            detach_loop(runner, &dev)?;
        }
        debug!(mount_point = %mount.mount_point.display(), "mount torn down");
        Ok(())
    }
}

fn chown(path: &Path, owner: libc::uid_t, group: libc::gid_t) -> Result<()> {
    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|e| Error::Other(format!("path contains a nul byte: {}", e)))?;
    let rc = unsafe { libc::chown(c_path.as_ptr(), owner, group) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn attach_loop(runner: &dyn Runner, path: &str, offset: u64, size_limit: u64) -> Result<String> {
    let offset_arg = offset.to_string();
    let mut args = vec!["--show", "-f", "--offset", &offset_arg];
    let size_arg = size_limit.to_string();
    if size_limit > 0 {
        args.push("--sizelimit");
        args.push(&size_arg);
    }
    args.push(path);
    let out = runner.run("losetup", &args, None)?;
    if !out.success() {
        return Err(Error::Other(format!(
            "losetup failed: {}",
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn detach_loop(runner: &dyn Runner, device: &str) -> Result<()> {
    let out = runner.run("losetup", &["-d", device], None)?;
    if !out.success() {
        warn!(device, "losetup -d failed during teardown");
    }
    Ok(())
}

fn do_mount(runner: &dyn Runner, device: &str, target: &Path, fstype: &str, read_only: bool) -> Result<()> {
    let target_str = target.to_string_lossy().to_string();
    let mut args = vec!["-t", fstype];
    if read_only {
        args.push("-o");
        args.push("ro");
    }
    args.push(device);
    args.push(&target_str);
    let out = runner.run("mount", &args, None)?;
    if !out.success() {
        return Err(Error::Other(format!("mount failed: {}", String::from_utf8_lossy(&out.stderr))));
    }
    Ok(())
}

fn do_umount(runner: &dyn Runner, target: &Path) -> Result<()> {
    let target_str = target.to_string_lossy().to_string();
    let out = runner.run("umount", &[target_str.as_str()], None)?;
    if !out.success() {
        return Err(Error::Other(format!("umount failed: {}", String::from_utf8_lossy(&out.stderr))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::mock::MockRunner;

    #[test]
    fn mount_point_is_created_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = MountManager::new(dir.path());
        let p = mgr.point_for("bundle-1");
        MountManager::ensure_dir(&p).unwrap();
        MountManager::ensure_dir(&p).unwrap();
        assert!(p.exists());
    }

    #[test]
    fn failed_loop_attach_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = MountManager::new(dir.path());
        let runner = MockRunner::failing(1);
        let result = mgr.mount_bundle(&runner, "bundle-1", "/nonexistent", 4096, BundleFormat::Plain, None, None);
        assert!(result.is_err());
    }
}
