//! Persisted slot status: what's currently written into a slot, and when.
//!
//! Two storage modes, matching spec.md's status/steering component: one
//! status file per slot (`<device>.raucs`-style sidecar, here a JSON file
//! next to the data directory) or one central file covering every slot.
//! Central mode uses the same key-file format as the system configuration.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::StatusStorage;
use crate::error::{Error, Result};
use crate::keyfile::KeyFile;
use crate::slot::SlotTable;

#[derive(Debug, Clone, Default)]
pub struct BundleInfo {
    pub compatible: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub build: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SlotStatus {
    pub status: String,
    pub checksum_algo: Option<String>,
    pub checksum_digest: Option<String>,
    pub installed_timestamp: Option<String>,
    pub installed_count: u64,
    pub activated_timestamp: Option<String>,
    pub activated_count: u64,
    pub bundle: Option<BundleInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct SystemStatus {
    pub boot_id: Option<String>,
}

fn slot_status_to_keyfile_section(kf: &mut KeyFile, group: &str, status: &SlotStatus) {
    kf.set_string(group, "status", status.status.clone());
    if let Some(a) = &status.checksum_algo {
        kf.set_string(group, "sha256", status.checksum_digest.clone().unwrap_or_default());
        let _ = a; // only sha256 is supported today, mirroring the manifest format
    }
    if let Some(ts) = &status.installed_timestamp {
        kf.set_string(group, "installed.timestamp", ts.clone());
    }
    kf.set_string(group, "installed.count", status.installed_count.to_string());
    if let Some(ts) = &status.activated_timestamp {
        kf.set_string(group, "activated.timestamp", ts.clone());
    }
    kf.set_string(group, "activated.count", status.activated_count.to_string());
    if let Some(bundle) = &status.bundle {
        kf.set_string(group, "bundle.compatible", bundle.compatible.clone());
        if let Some(v) = &bundle.version {
            kf.set_string(group, "bundle.version", v.clone());
        }
        if let Some(d) = &bundle.description {
            kf.set_string(group, "bundle.description", d.clone());
        }
        if let Some(b) = &bundle.build {
            kf.set_string(group, "bundle.build", b.clone());
        }
    }
}

fn slot_status_from_keyfile_section(kf: &KeyFile, group: &str) -> SlotStatus {
    let bundle = kf.get_string(group, "bundle.compatible").map(|c| BundleInfo {
        compatible: c.to_string(),
        version: kf.get_string(group, "bundle.version").map(|s| s.to_string()),
        description: kf.get_string(group, "bundle.description").map(|s| s.to_string()),
        build: kf.get_string(group, "bundle.build").map(|s| s.to_string()),
    });
    SlotStatus {
        status: kf.get_string(group, "status").unwrap_or("").to_string(),
        checksum_algo: kf.get_string(group, "sha256").map(|_| "sha256".to_string()),
        checksum_digest: kf.get_string(group, "sha256").map(|s| s.to_string()),
        installed_timestamp: kf.get_string(group, "installed.timestamp").map(|s| s.to_string()),
        installed_count: kf.get_u64(group, "installed.count").ok().flatten().unwrap_or(0),
        activated_timestamp: kf.get_string(group, "activated.timestamp").map(|s| s.to_string()),
        activated_count: kf.get_u64(group, "activated.count").ok().flatten().unwrap_or(0),
        bundle,
    }
}

/// Loads persisted status into the slot table's `status`/`boot_good`
/// fields, choosing per-slot sidecar files or a single central file
/// depending on configuration.
pub fn load(mode: StatusStorage, data_directory: &str, slots: &mut SlotTable) -> Result<SystemStatus> {
    match mode {
        StatusStorage::Central => load_central(data_directory, slots),
        StatusStorage::PerSlot => load_per_slot(slots),
    }
}

pub fn save(mode: StatusStorage, data_directory: &str, slots: &SlotTable, system: &SystemStatus) -> Result<()> {
    match mode {
        StatusStorage::Central => save_central(data_directory, slots, system),
        StatusStorage::PerSlot => save_per_slot(slots),
    }
}

fn central_path(data_directory: &str) -> PathBuf {
    Path::new(data_directory).join("central.status")
}

fn load_central(data_directory: &str, slots: &mut SlotTable) -> Result<SystemStatus> {
    let path = central_path(data_directory);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SystemStatus::default()),
        Err(e) => return Err(Error::Io(e)),
    };

    let kf = match KeyFile::parse(&contents) {
        Ok(kf) => kf,
        Err(e) => {
            // Move the unparseable file aside rather than lose whatever
            // install history it might still partially contain.
            let backup = path.with_extension(format!("status.corrupt.{}", stamp()));
            warn!(error = %e, path = %path.display(), backup = %backup.display(), "status file unparseable, moving aside");
            let _ = fs::rename(&path, &backup);
            return Ok(SystemStatus::default());
        }
    };

    let boot_id = kf.get_string("system", "boot-id").map(|s| s.to_string());
    for slot in slots.iter_mut() {
        let group = format!("slot.{}", slot.name);
        if kf.groups().any(|g| g == group) {
            slot.status = Some(slot_status_from_keyfile_section(&kf, &group));
        }
    }

    Ok(SystemStatus { boot_id })
}

fn save_central(data_directory: &str, slots: &SlotTable, system: &SystemStatus) -> Result<()> {
    fs::create_dir_all(data_directory).map_err(Error::Io)?;
    let path = central_path(data_directory);

    let mut kf = KeyFile::new();
    if let Some(id) = &system.boot_id {
        kf.set_string("system", "boot-id", id.clone());
    }
    for slot in slots.iter() {
        if let Some(status) = &slot.status {
            let group = format!("slot.{}", slot.name);
            slot_status_to_keyfile_section(&mut kf, &group, status);
        }
    }

    atomic_write(&path, kf.to_string_pretty().as_bytes())
}

fn per_slot_sidecar(slot_device: &str) -> PathBuf {
    PathBuf::from(format!("{}.status", slot_device))
}

fn load_per_slot(slots: &mut SlotTable) -> Result<SystemStatus> {
    for slot in slots.iter_mut() {
        let path = per_slot_sidecar(&slot.device);
        match fs::read_to_string(&path) {
            Ok(contents) => match KeyFile::parse(&contents) {
                Ok(kf) => slot.status = Some(slot_status_from_keyfile_section(&kf, "slot")),
                Err(e) => {
                    let backup = path.with_extension(format!("status.corrupt.{}", stamp()));
                    warn!(error = %e, path = %path.display(), "per-slot status file unparseable, moving aside");
                    let _ = fs::rename(&path, &backup);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(SystemStatus::default())
}

fn save_per_slot(slots: &SlotTable) -> Result<()> {
    for slot in slots.iter() {
        let Some(status) = &slot.status else { continue };
        let mut kf = KeyFile::new();
        slot_status_to_keyfile_section(&mut kf, "slot", status);
        atomic_write(&per_slot_sidecar(&slot.device), kf.to_string_pretty().as_bytes())?;
    }
    Ok(())
}

fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(Error::Io)?;
    use std::io::Write;
    tmp.write_all(contents).map_err(Error::Io)?;
    tmp.persist(path)
        .map_err(|e| Error::Other(format!("failed to persist status file: {}", e)))?;
    Ok(())
}

fn stamp() -> String {
    // Callers only need uniqueness, not wall-clock time (the crate avoids
    // `Date::now`-style calls); a random suffix is enough to avoid
    // clobbering a previous backup.
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Slot;

    #[test]
    fn central_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut slots = SlotTable::new();
        let mut s = Slot::new("rootfs.0", "rootfs", "/dev/null");
        s.status = Some(SlotStatus {
            status: "ok".to_string(),
            checksum_algo: Some("sha256".to_string()),
            checksum_digest: Some("abc".to_string()),
            installed_timestamp: Some("2026-01-01T00:00:00Z".to_string()),
            installed_count: 1,
            activated_timestamp: None,
            activated_count: 0,
            bundle: None,
        });
        slots.insert(s);

        let system = SystemStatus {
            boot_id: Some("boot-1".to_string()),
        };
        save_central(dir.path().to_str().unwrap(), &slots, &system).unwrap();

        let mut reloaded = SlotTable::new();
        reloaded.insert(Slot::new("rootfs.0", "rootfs", "/dev/null"));
        let loaded = load_central(dir.path().to_str().unwrap(), &mut reloaded).unwrap();
        assert_eq!(loaded.boot_id.as_deref(), Some("boot-1"));
        assert_eq!(reloaded.get("rootfs.0").unwrap().status.as_ref().unwrap().status, "ok");
    }

    #[test]
    fn missing_central_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut slots = SlotTable::new();
        slots.insert(Slot::new("rootfs.0", "rootfs", "/dev/null"));
        let status = load_central(dir.path().to_str().unwrap(), &mut slots).unwrap();
        assert!(status.boot_id.is_none());
    }
}
