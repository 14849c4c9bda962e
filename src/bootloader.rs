//! Bootloader steering: primary-slot selection and good/bad marking.
//!
//! Each supported bootloader is a thin wrapper around its vendor tool,
//! dispatched through [`Runner`](crate::subprocess::Runner) so the
//! steering logic itself stays testable. Grounded on the teacher's
//! `bootloader::bootcontrol` trait split (a narrow trait, one impl per
//! backend) generalized from the fixed Android A/B scheme to named
//! slots and an arbitrary bootloader choice per `[system] bootloader=`.

use tracing::info;

use crate::config::Bootloader;
use crate::error::{Result, SlotError};
use crate::slot::{Slot, SlotTable};
use crate::subprocess::Runner;

/// What a backend needs to be able to do to steer the next boot.
pub trait BootloaderBackend {
    /// Returns the bootname of the slot the bootloader will boot next.
    fn get_primary(&self, runner: &dyn Runner) -> Result<String>;
    /// Tells the bootloader to boot `bootname` next.
    fn set_primary(&self, runner: &dyn Runner, bootname: &str) -> Result<()>;
    /// Marks `bootname` good (cancels any pending rollback) or bad
    /// (forces a rollback on next reboot).
    fn set_state(&self, runner: &dyn Runner, bootname: &str, good: bool) -> Result<()>;
}

pub struct UBootBackend;
pub struct BareboxBackend;
pub struct GrubBackend;
pub struct EfiBackend;
pub struct CustomBackend {
    pub script: String,
}

impl BootloaderBackend for UBootBackend {
    fn get_primary(&self, runner: &dyn Runner) -> Result<String> {
        let out = runner.run("fw_printenv", &["-n", "BOOT_ORDER"], None)?;
        let text = String::from_utf8_lossy(&out.stdout);
        let first = text
            .split_whitespace()
            .next()
            .ok_or_else(|| SlotError::Failed("BOOT_ORDER is empty".to_string()))?;
        Ok(first.to_string())
    }

    fn set_primary(&self, runner: &dyn Runner, bootname: &str) -> Result<()> {
        let value = format!("BOOT_ORDER={}", bootname);
        runner.run("fw_setenv", &["BOOT_ORDER", &value], None)?;
        Ok(())
    }

    fn set_state(&self, runner: &dyn Runner, bootname: &str, good: bool) -> Result<()> {
        let var = format!("BOOT_{}_LEFT", bootname.to_uppercase());
        let value = if good { "3" } else { "0" };
        runner.run("fw_setenv", &[&var, value], None)?;
        Ok(())
    }
}

impl BootloaderBackend for BareboxBackend {
    fn get_primary(&self, runner: &dyn Runner) -> Result<String> {
        let out = runner.run("barebox-state", &["-g", "bootstate.active"], None)?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn set_primary(&self, runner: &dyn Runner, bootname: &str) -> Result<()> {
        runner.run("barebox-state", &["-s", &format!("bootstate.active={}", bootname)], None)?;
        Ok(())
    }

    fn set_state(&self, runner: &dyn Runner, bootname: &str, good: bool) -> Result<()> {
        let key = format!("bootstate.{}.priority", bootname);
        let value = if good { "20" } else { "0" };
        runner.run("barebox-state", &["-s", &format!("{}={}", key, value)], None)?;
        Ok(())
    }
}

impl BootloaderBackend for GrubBackend {
    fn get_primary(&self, runner: &dyn Runner) -> Result<String> {
        let out = runner.run("grub-editenv", &["list"], None)?;
        let text = String::from_utf8_lossy(&out.stdout);
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("ORDER=") {
                return Ok(value.split_whitespace().next().unwrap_or_default().to_string());
            }
        }
        Err(SlotError::Failed("ORDER not found in grubenv".to_string()).into())
    }

    fn set_primary(&self, runner: &dyn Runner, bootname: &str) -> Result<()> {
        runner.run("grub-editenv", &["-", "set", &format!("ORDER={}", bootname)], None)?;
        Ok(())
    }

    fn set_state(&self, runner: &dyn Runner, bootname: &str, good: bool) -> Result<()> {
        let key = format!("{}_OK", bootname);
        let value = if good { "1" } else { "0" };
        runner.run("grub-editenv", &["-", "set", &format!("{}={}", key, value)], None)?;
        Ok(())
    }
}

impl BootloaderBackend for EfiBackend {
    fn get_primary(&self, runner: &dyn Runner) -> Result<String> {
        let out = runner.run("efibootmgr", &[], None)?;
        let text = String::from_utf8_lossy(&out.stdout);
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("BootCurrent: ") {
                return Ok(value.trim().to_string());
            }
        }
        Err(SlotError::Failed("BootCurrent not found in efibootmgr output".to_string()).into())
    }

    fn set_primary(&self, runner: &dyn Runner, bootname: &str) -> Result<()> {
        runner.run("efibootmgr", &["--bootnext", bootname], None)?;
        Ok(())
    }

    fn set_state(&self, runner: &dyn Runner, bootname: &str, good: bool) -> Result<()> {
        let flag = if good { "--bootorder-first" } else { "--delete-bootnext" };
        runner.run("efibootmgr", &[flag, bootname], None)?;
        Ok(())
    }
}

impl BootloaderBackend for CustomBackend {
    fn get_primary(&self, runner: &dyn Runner) -> Result<String> {
        let out = runner.run(&self.script, &["get-primary"], None)?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn set_primary(&self, runner: &dyn Runner, bootname: &str) -> Result<()> {
        runner.run(&self.script, &["set-primary", bootname], None)?;
        Ok(())
    }

    fn set_state(&self, runner: &dyn Runner, bootname: &str, good: bool) -> Result<()> {
        let arg = if good { "good" } else { "bad" };
        runner.run(&self.script, &["set-state", bootname, arg], None)?;
        Ok(())
    }
}

pub fn backend_for(kind: Bootloader, custom_script: Option<&str>) -> Box<dyn BootloaderBackend> {
    match kind {
        Bootloader::Uboot => Box::new(UBootBackend),
        Bootloader::Barebox => Box::new(BareboxBackend),
        Bootloader::Grub => Box::new(GrubBackend),
        Bootloader::Efi => Box::new(EfiBackend),
        Bootloader::Custom => Box::new(CustomBackend {
            script: custom_script.unwrap_or("/usr/lib/slotupd/custom-bootloader").to_string(),
        }),
    }
}

/// Identifier used to pick which slot a `mark` operation targets,
/// resolved against the table's already-computed slot states.
pub enum SlotIdentifier<'a> {
    Booted,
    Other,
    Named(&'a str),
}

fn resolve<'a>(slots: &'a SlotTable, id: SlotIdentifier) -> Result<&'a Slot> {
    match id {
        SlotIdentifier::Booted => slots
            .iter()
            .find(|s| s.state == crate::slot::SlotState::Booted)
            .ok_or_else(|| SlotError::NoSlotWithStateBooted("booted".to_string()).into()),
        SlotIdentifier::Other => {
            let booted_root = slots
                .iter()
                .find(|s| s.state == crate::slot::SlotState::Booted)
                .and_then(|s| slots.root_of(&s.name))
                .ok_or_else(|| SlotError::NoSlotWithStateBooted("booted".to_string()))?;
            slots
                .roots_of_class(
                    slots
                        .get(booted_root)
                        .map(|s| s.class.as_str())
                        .unwrap_or_default(),
                )
                .find(|s| s.name != booted_root)
                .ok_or_else(|| SlotError::Failed("no other slot in the booted root's class".to_string()).into())
        }
        SlotIdentifier::Named(name) => slots
            .get(name)
            .ok_or_else(|| SlotError::Failed(format!("no such slot '{}'", name)).into()),
    }
}

/// Marks a slot good, bad, or sets it as the next-boot primary. Mirrors
/// `mark.c`'s identifier resolution (`booted`/`other`/explicit name)
/// ahead of the steering action itself.
pub fn mark(
    slots: &SlotTable,
    backend: &dyn BootloaderBackend,
    runner: &dyn Runner,
    id: SlotIdentifier,
    action: MarkAction,
) -> Result<()> {
    let slot = resolve(slots, id)?;
    let bootname = slot
        .bootname
        .as_deref()
        .ok_or_else(|| SlotError::Failed(format!("slot '{}' has no bootname, cannot mark", slot.name)))?;

    match action {
        MarkAction::Good => backend.set_state(runner, bootname, true)?,
        MarkAction::Bad => backend.set_state(runner, bootname, false)?,
        MarkAction::Active => backend.set_primary(runner, bootname)?,
    }
    info!(slot = %slot.name, bootname, action = ?action, "slot marked");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum MarkAction {
    Good,
    Bad,
    Active,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::mock::MockRunner;

    fn slots_with_booted() -> SlotTable {
        let mut t = SlotTable::new();
        let mut a = Slot::new("rootfs.0", "rootfs", "/dev/sda1");
        a.bootname = Some("A".to_string());
        a.state = crate::slot::SlotState::Booted;
        let mut b = Slot::new("rootfs.1", "rootfs", "/dev/sda2");
        b.bootname = Some("B".to_string());
        b.state = crate::slot::SlotState::Inactive;
        t.insert(a);
        t.insert(b);
        t
    }

    #[test]
    fn mark_other_resolves_to_sibling_slot() {
        let slots = slots_with_booted();
        let backend = UBootBackend;
        let runner = MockRunner::ok();
        mark(&slots, &backend, &runner, SlotIdentifier::Other, MarkAction::Good).unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].1[0], "BOOT_B_LEFT");
    }

    #[test]
    fn mark_booted_uses_booted_slots_bootname() {
        let slots = slots_with_booted();
        let backend = GrubBackend;
        let runner = MockRunner::ok();
        mark(&slots, &backend, &runner, SlotIdentifier::Booted, MarkAction::Active).unwrap();
        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].1.iter().any(|a| a == "ORDER=A"));
    }
}
