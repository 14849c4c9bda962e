//! Tarball-to-filesystem handler: make a fresh filesystem of the slot's
//! type on the device, mount it at a scratch point, extract the
//! archive, sync, unmount.

use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::Image;
use crate::slot::{Slot, SlotType};

use super::{source_path, HandlerContext};

fn mkfs_program(fstype: &SlotType) -> Result<&'static str> {
    match fstype {
        SlotType::Ext4 => Ok("mkfs.ext4"),
        SlotType::Ubifs => Ok("mkfs.ubifs"),
        SlotType::Vfat => Ok("mkfs.vfat"),
        other => Err(Error::Other(format!("slot type {:?} cannot be freshly formatted for tar install", other))),
    }
}

pub fn write(image: &Image, slot: &Slot, ctx: &HandlerContext) -> Result<()> {
    let mkfs = mkfs_program(&slot.fstype)?;
    let out = ctx.runner.run(mkfs, &[&slot.device], None)?;
    if !out.success() {
        return Err(Error::Other(format!(
            "{} failed on {}: {}",
            mkfs,
            slot.device,
            String::from_utf8_lossy(&out.stderr)
        )));
    }

    let scratch = std::env::temp_dir().join(format!("slotupd-tar-{}", slot.name.replace('.', "-")));
    std::fs::create_dir_all(&scratch).map_err(Error::Io)?;
    let scratch_str = scratch.to_string_lossy().to_string();

    let mount_out = ctx.runner.run("mount", &[&slot.device, &scratch_str], None)?;
    if !mount_out.success() {
        return Err(Error::Other(format!(
            "mount failed for tar extraction onto {}: {}",
            slot.device,
            String::from_utf8_lossy(&mount_out.stderr)
        )));
    }

    let extract_result = (|| -> Result<()> {
        let source = source_path(ctx, image);
        let source_str = source.to_string_lossy().to_string();
        let tar_out = ctx
            .runner
            .run("tar", &["-xf", &source_str, "-C", &scratch_str], None)?;
        if !tar_out.success() {
            return Err(Error::Other(format!(
                "tar extraction failed: {}",
                String::from_utf8_lossy(&tar_out.stderr)
            )));
        }
        Ok(())
    })();

    let sync_result = ctx.runner.run("sync", &[], None);
    let umount_out = ctx.runner.run("umount", &[&scratch_str], None);

    extract_result?;
    if let Ok(out) = sync_result {
        if !out.success() {
            debug!(slot = %slot.name, "sync reported non-zero exit after tar extraction");
        }
    }
    if let Ok(out) = umount_out {
        if !out.success() {
            return Err(Error::Other(format!("umount failed for {}", scratch_str)));
        }
    }

    let _ = std::fs::remove_dir(&scratch);
    Ok(())
}
