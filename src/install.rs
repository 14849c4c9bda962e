//! Top-level install orchestration: check-bundle, load-manifest, plan,
//! write each image in sequence, steer the bootloader. Implements the
//! propagation policy of spec.md §7: planning errors abort before any
//! mutation; a write error aborts the remaining images and leaves the
//! bootloader untouched; a steering error after a successful write
//! still surfaces as a failed install even though storage is good.

use std::path::Path;

use tracing::{info, warn};

use crate::bootloader::{BootloaderBackend, MarkAction, SlotIdentifier};
use crate::context::Context;
use crate::error::{InstallError, Result};
use crate::handlers::{self, HandlerContext};
use crate::manifest::{Image, Manifest};
use crate::planner::{self, BootToken};
use crate::slot::Slot;
use crate::status::{BundleInfo, SlotStatus};

pub struct InstallOutcome {
    pub written_slots: Vec<String>,
}

/// Runs install-check hook, if the manifest declares one, failing the
/// whole install with the hook's own message on rejection.
fn run_install_check(ctx: &Context, manifest: &Manifest) -> Result<()> {
    if !manifest.hooks.install_check {
        return Ok(());
    }
    let out = ctx.runner.run("rauc-hook", &["install-check"], None)?;
    if !out.success() {
        let message = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(InstallError::RejectedHook(if message.is_empty() {
            "install-check hook rejected the bundle".to_string()
        } else {
            message
        })
        .into());
    }
    Ok(())
}

/// Runs a per-image `pre-install` or `post-install` hook, if the image
/// declares one for that stage. Mirrors `run_install_check`'s
/// subprocess-and-fail-on-nonzero shape, but scoped to a single image
/// and slot (spec.md §4.3 steps 1 and 6).
fn run_slot_hook(ctx: &Context, handler_ctx: &HandlerContext, stage: &str, image: &Image, slot: &Slot) -> Result<()> {
    let enabled = match stage {
        "pre-install" => image.hooks.pre_install,
        "post-install" => image.hooks.post_install,
        _ => unreachable!("run_slot_hook called with unknown stage"),
    };
    if !enabled {
        return Ok(());
    }
    let source = handlers::source_path(handler_ctx, image).to_string_lossy().to_string();
    let out = ctx.runner.run("rauc-hook", &[stage, &source, &slot.device, &slot.name], None)?;
    if !out.success() {
        let message = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(InstallError::RejectedHook(if message.is_empty() {
            format!("{} hook exited with status {}", stage, out.exit_code)
        } else {
            message
        })
        .into());
    }
    Ok(())
}

/// Runs the full pipeline against an already-opened, already-verified
/// bundle mounted at `bundle_mount_root`.
pub fn install(
    ctx: &mut Context,
    manifest: &Manifest,
    bundle_mount_root: &Path,
    boot_token: BootToken,
    device_variant: Option<&str>,
    backend: &dyn BootloaderBackend,
) -> Result<InstallOutcome> {
    manifest.check_external(&ctx.config.compatible)?;
    run_install_check(ctx, manifest)?;

    planner::determine_slot_states(ctx.slots_mut(), boot_token)?;
    planner::require_booted_slot(ctx.slots())?;

    let target_group = planner::determine_target_install_group(ctx.slots());
    let plan = planner::map_images_to_slots(manifest, &target_group, ctx.slots(), device_variant)?;

    info!(images = plan.len(), "install plan computed");

    let mut written_slots = Vec::new();
    for (image, slot_name) in &plan {
        let slot = ctx
            .slots()
            .get(slot_name)
            .expect("planner only returns slots that exist")
            .clone();

        if handlers::already_installed(&slot, image) {
            info!(slot = %slot.name, "slot already matches image checksum, skipping write");
            continue;
        }

        // Rebuilt at each use: it borrows `ctx.runner`, and that borrow
        // must not outlive the `ctx.slots_mut()`/`ctx.save_status()`
        // calls interleaved below, so it is never held across them.
        let handler_ctx = HandlerContext {
            bundle_mount_root,
            runner: ctx.runner.as_ref(),
        };
        if let Err(e) = run_slot_hook(ctx, &handler_ctx, "pre-install", image, &slot) {
            warn!(slot = %slot.name, error = %e, "pre-install hook rejected image, aborting remaining images");
            return Err(e);
        }

        let handler_ctx = HandlerContext {
            bundle_mount_root,
            runner: ctx.runner.as_ref(),
        };
        let dispatch_result = handlers::dispatch(image, &slot, &handler_ctx);

        match dispatch_result {
            Ok(_) => {
                let new_status = SlotStatus {
                    status: "ok".to_string(),
                    checksum_algo: Some(image.checksum.algo.clone()),
                    checksum_digest: Some(image.checksum.digest.clone()),
                    installed_timestamp: None,
                    installed_count: slot
                        .status
                        .as_ref()
                        .map(|s| s.installed_count + 1)
                        .unwrap_or(1),
                    activated_timestamp: None,
                    activated_count: slot.status.as_ref().map(|s| s.activated_count).unwrap_or(0),
                    bundle: Some(BundleInfo {
                        compatible: manifest.compatible.clone(),
                        version: manifest.version.clone(),
                        description: manifest.description.clone(),
                        build: manifest.build.clone(),
                    }),
                };
                if let Some(s) = ctx.slots_mut().get_mut(slot_name) {
                    s.status = Some(new_status);
                }
                ctx.save_status()?;

                let handler_ctx = HandlerContext {
                    bundle_mount_root,
                    runner: ctx.runner.as_ref(),
                };
                run_slot_hook(ctx, &handler_ctx, "post-install", image, &slot)?;
                written_slots.push(slot_name.clone());
            }
            Err(e) => {
                warn!(slot = %slot.name, error = %e, "write failed, aborting remaining images");
                if let Some(s) = ctx.slots_mut().get_mut(slot_name) {
                    if let Some(status) = &mut s.status {
                        status.status = "failed".to_string();
                    } else {
                        s.status = Some(SlotStatus {
                            status: "failed".to_string(),
                            ..Default::default()
                        });
                    }
                }
                let _ = ctx.save_status();
                return Err(e);
            }
        }
    }

    steer_bootloader(ctx, backend, &written_slots)?;

    Ok(InstallOutcome { written_slots })
}

/// Marks the freshly written root slot primary, then clears its good
/// flag so a failed boot rolls back. Order matters: primary first,
/// good-flag clear second, so a crash between the two still leaves the
/// bootloader able to retry the old primary.
fn steer_bootloader(ctx: &Context, backend: &dyn BootloaderBackend, written_slots: &[String]) -> Result<()> {
    let Some(root_slot_name) = written_slots
        .iter()
        .find(|name| ctx.slots().get(name).map(|s| s.is_root()).unwrap_or(false))
    else {
        return Ok(());
    };

    let slot = ctx.slots().get(root_slot_name).expect("found above");
    let bootname = slot
        .bootname
        .as_ref()
        .ok_or_else(|| crate::error::SlotError::Failed(format!("slot '{}' has no bootname", slot.name)))?;

    backend.set_primary(ctx.runner.as_ref(), bootname)?;
    backend.set_state(ctx.runner.as_ref(), bootname, false)?;
    info!(slot = %slot.name, bootname, "bootloader steered to new slot");
    Ok(())
}

/// Called by an external actor (init script, health check) once the
/// newly installed slot has booted successfully.
pub fn mark_boot_successful(ctx: &Context, backend: &dyn BootloaderBackend) -> Result<()> {
    crate::bootloader::mark(
        ctx.slots(),
        backend,
        ctx.runner.as_ref(),
        SlotIdentifier::Booted,
        MarkAction::Good,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::UBootBackend;
    use crate::config::SystemConfig;
    use crate::manifest::Manifest;
    use crate::subprocess::mock::MockRunner;

    fn config() -> SystemConfig {
        SystemConfig::parse(
            "\
[system]
compatible=dev
bootloader=uboot

[slot.rootfs.0]
device=/dev/null
type=ext4
bootname=A

[slot.rootfs.1]
device=/dev/null
type=ext4
bootname=B
",
        )
        .unwrap()
    }

    fn manifest() -> Manifest {
        Manifest::parse(
            "\
[update]
compatible=dev

[image.rootfs]
filename=rootfs.bin
sha256=abc
size=0
",
        )
        .unwrap()
    }

    #[test]
    fn install_check_hook_rejection_aborts_before_planning() {
        let mut ctx = Context {
            config: config(),
            system_status: Default::default(),
            runner: Box::new(MockRunner::failing(1)),
        };
        let mut m = manifest();
        m.hooks.install_check = true;
        let dir = tempfile::tempdir().unwrap();
        let err = install(
            &mut ctx,
            &m,
            dir.path(),
            BootToken::Bootname("A"),
            None,
            &UBootBackend,
        )
        .unwrap_err();
        assert_eq!(err.leaf_kind(), "INSTALL");
    }

    #[test]
    fn compatible_mismatch_is_rejected_before_planning() {
        let mut ctx = Context {
            config: config(),
            system_status: Default::default(),
            runner: Box::new(MockRunner::ok()),
        };
        let mut m = manifest();
        m.compatible = "other-device".to_string();
        let dir = tempfile::tempdir().unwrap();
        let err = install(
            &mut ctx,
            &m,
            dir.path(),
            BootToken::Bootname("A"),
            None,
            &UBootBackend,
        )
        .unwrap_err();
        assert_eq!(err.leaf_kind(), "MANIFEST");
    }
}
