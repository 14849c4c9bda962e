//! System configuration: the `[system]`/`[keyring]`/... sections plus the
//! `[slot.CLASS.INDEX]` slot graph declarations.
//!
//! Parsing and validation follow `config_file.c`: slot sections are parsed
//! in two passes (collect, then resolve `parent=` references to indices),
//! followed by a grandparent-link normalization pass bounded at 100 hops.

use std::collections::{HashMap, HashSet};

use crate::error::{ConfigError, Result};
use crate::keyfile::KeyFile;
use crate::slot::{Slot, SlotTable, SlotType};

const MAX_PARENT_HOPS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootloader {
    Uboot,
    Barebox,
    Grub,
    Efi,
    Custom,
}

impl Bootloader {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "uboot" => Bootloader::Uboot,
            "barebox" => Bootloader::Barebox,
            "grub" => Bootloader::Grub,
            "efi" => Bootloader::Efi,
            "custom" => Bootloader::Custom,
            other => return Err(ConfigError::Bootloader(other.to_string()).into()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeyringConfig {
    pub path: Option<String>,
    pub directory: Option<String>,
    pub check_crl: bool,
    pub allowed_signer_names: Vec<String>,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        KeyringConfig {
            path: None,
            directory: None,
            check_crl: false,
            allowed_signer_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub compatible: String,
    pub bootloader: Bootloader,
    pub data_directory: String,
    pub status_storage: StatusStorage,
    pub max_bundle_download_size: u64,
    pub bundle_formats_mask: BundleFormatMask,
    pub keyring: KeyringConfig,
    pub activate_installed: bool,
    pub boot_attempts: Option<u32>,
    pub handlers: HashMap<String, String>,
    pub slots: SlotTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStorage {
    PerSlot,
    Central,
}

/// Which container formats this system accepts, derived from
/// `parse_bundle_formats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleFormatMask {
    pub plain: bool,
    pub verity: bool,
    pub crypt: bool,
}

impl BundleFormatMask {
    pub fn all() -> Self {
        BundleFormatMask {
            plain: true,
            verity: true,
            crypt: true,
        }
    }

    fn set(&mut self, token: &str, value: bool) -> Result<()> {
        match token {
            "plain" => self.plain = value,
            "verity" => self.verity = value,
            "crypt" => self.crypt = value,
            other => return Err(ConfigError::InvalidFormat(other.to_string()).into()),
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        !self.plain && !self.verity && !self.crypt
    }
}

/// Parses the `bundle-formats=` value against a starting mask (normally
/// "all enabled"). A bare token list *replaces* the mask; a `+`/`-`
/// prefixed token list *modifies* it. Mixing the two styles in one string
/// is rejected, matching the original's refusal to guess intent.
pub fn parse_bundle_formats(value: &str) -> Result<BundleFormatMask> {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(BundleFormatMask::all());
    }

    let modifying = tokens.iter().any(|t| t.starts_with('+') || t.starts_with('-'));
    let bare = tokens.iter().any(|t| !t.starts_with('+') && !t.starts_with('-'));
    if modifying && bare {
        return Err(ConfigError::InvalidFormat(
            "cannot mix plain and +/- prefixed tokens in bundle-formats".to_string(),
        )
        .into());
    }

    let mut mask = if modifying {
        BundleFormatMask::all()
    } else {
        BundleFormatMask::default()
    };

    for tok in tokens {
        if let Some(name) = tok.strip_prefix('+') {
            mask.set(name, true)?;
        } else if let Some(name) = tok.strip_prefix('-') {
            mask.set(name, false)?;
        } else {
            mask.set(tok, true)?;
        }
    }

    if mask.is_empty() {
        return Err(ConfigError::InvalidFormat(
            "bundle-formats resolves to an empty set".to_string(),
        )
        .into());
    }

    Ok(mask)
}

impl SystemConfig {
    pub fn parse(contents: &str) -> Result<Self> {
        let kf = KeyFile::parse(contents)?;

        let compatible = kf
            .get_string("system", "compatible")
            .ok_or_else(|| ConfigError::InvalidFormat("missing [system] compatible=".to_string()))?
            .to_string();
        let bootloader_str = kf
            .get_string("system", "bootloader")
            .ok_or_else(|| ConfigError::InvalidFormat("missing [system] bootloader=".to_string()))?;
        let bootloader = Bootloader::parse(bootloader_str)?;

        let data_directory = kf
            .get_string("system", "data-directory")
            .unwrap_or("/var/lib/slotupd")
            .to_string();
        if !data_directory.starts_with('/') {
            return Err(ConfigError::DataDirectory(data_directory).into());
        }

        let status_storage = match kf.get_string("system", "statusfile") {
            Some("per-slot") | None => StatusStorage::PerSlot,
            Some("central") => StatusStorage::Central,
            Some(other) => {
                return Err(ConfigError::InvalidFormat(format!("unknown statusfile mode '{}'", other)).into())
            }
        };

        let max_bundle_download_size = match kf.get_string("system", "max-bundle-download-size") {
            Some(s) => s
                .parse::<u64>()
                .map_err(|_| ConfigError::MaxBundleDownloadSize(s.to_string()))?,
            None => 0, // 0 == unlimited
        };

        let bundle_formats_mask = match kf.get_string("system", "bundle-formats") {
            Some(s) => parse_bundle_formats(s)?,
            None => BundleFormatMask::all(),
        };

        let activate_installed = kf.get_bool("system", "activate-installed")?.unwrap_or(true);
        let boot_attempts = kf
            .get_string("system", "boot-attempts")
            .map(|s| s.parse::<u32>())
            .transpose()
            .map_err(|_| ConfigError::InvalidFormat("boot-attempts must be an integer".to_string()))?;

        let mut keyring = KeyringConfig::default();
        keyring.path = kf.get_string("keyring", "path").map(|s| s.to_string());
        keyring.directory = kf.get_string("keyring", "directory").map(|s| s.to_string());
        keyring.check_crl = kf.get_bool("keyring", "check-crl")?.unwrap_or(false);
        if let Some(names) = kf.get_string("keyring", "allowed-signer-names") {
            keyring.allowed_signer_names = names.split_whitespace().map(|s| s.to_string()).collect();
        }

        let mut handlers = HashMap::new();
        for key in kf.keys("handlers") {
            if let Some(value) = kf.get_string("handlers", key) {
                handlers.insert(key.to_string(), value.to_string());
            }
        }

        let slots = parse_slots(&kf)?;

        Ok(SystemConfig {
            compatible,
            bootloader,
            data_directory,
            status_storage,
            max_bundle_download_size,
            bundle_formats_mask,
            keyring,
            activate_installed,
            boot_attempts,
            handlers,
            slots,
        })
    }
}

fn parse_slots(kf: &KeyFile) -> Result<SlotTable> {
    let dotted = kf.dotted_groups("slot");
    let mut table = SlotTable::new();
    // name -> raw parent reference (slot name as written, e.g. "rootfs.0")
    let mut raw_parents: HashMap<String, String> = HashMap::new();
    let mut seen_bootnames: HashSet<String> = HashSet::new();

    for (group, parts) in &dotted {
        if parts.len() != 2 {
            return Err(ConfigError::InvalidFormat(format!(
                "slot section '{}' must have exactly class and index parts",
                group
            ))
            .into());
        }
        let class = parts[0].clone();
        let index = &parts[1];
        let name = format!("{}.{}", class, index);

        let device = kf
            .get_string(group, "device")
            .ok_or_else(|| ConfigError::InvalidDevice(name.clone(), "missing device=".to_string()))?
            .to_string();
        let fstype_str = kf.get_string(group, "type").unwrap_or("raw");
        let fstype = SlotType::parse(fstype_str);
        if !fstype.is_valid() {
            return Err(ConfigError::SlotType(fstype_str.to_string(), name.clone()).into());
        }

        let mut slot = Slot::new(name.clone(), class, device);
        slot.fstype = fstype;
        slot.readonly = kf.get_bool(group, "readonly")?.unwrap_or(false);
        slot.install_same = kf.get_bool(group, "install-same")?.unwrap_or(false);
        slot.resize = kf.get_bool(group, "resize")?.unwrap_or(false);
        slot.allow_mounted = kf.get_bool(group, "allow-mounted")?.unwrap_or(false);
        slot.extra_mount_opts = kf.get_string(group, "extra-mount-opts").map(|s| s.to_string());
        if let Some(region) = kf.get_string(group, "region-start") {
            slot.region_start = Some(
                region
                    .parse()
                    .map_err(|_| ConfigError::InvalidFormat(format!("bad region-start for {}", name)))?,
            );
        }
        if let Some(region) = kf.get_string(group, "region-size") {
            slot.region_size = Some(
                region
                    .parse()
                    .map_err(|_| ConfigError::InvalidFormat(format!("bad region-size for {}", name)))?,
            );
        }

        if let Some(bootname) = kf.get_string(group, "bootname") {
            if !seen_bootnames.insert(bootname.to_string()) {
                return Err(ConfigError::DuplicateBootname(bootname.to_string()).into());
            }
            slot.bootname = Some(bootname.to_string());
        }

        if let Some(parent) = kf.get_string(group, "parent") {
            raw_parents.insert(name.clone(), parent.to_string());
        }

        table.insert(slot);
    }

    // Children must not declare a bootname of their own.
    for (child, _) in &raw_parents {
        if table.get(child).and_then(|s| s.bootname.clone()).is_some() {
            return Err(ConfigError::ChildHasBootname(child.clone()).into());
        }
    }

    // Resolve each declared parent reference to its root, walking the
    // chain and normalizing any grandparent links, bounded to catch loops.
    for (child, parent_ref) in &raw_parents {
        if table.get(parent_ref).is_none() {
            return Err(ConfigError::Parent(parent_ref.clone()).into());
        }
        let mut current = parent_ref.clone();
        let mut hops = 0;
        loop {
            let next = raw_parents.get(&current).cloned();
            match next {
                None => break,
                Some(next_parent) => {
                    hops += 1;
                    if hops > MAX_PARENT_HOPS {
                        return Err(ConfigError::ParentLoop(child.clone()).into());
                    }
                    current = next_parent;
                }
            }
        }
        if let Some(slot) = table.get_mut(child) {
            slot.parent = Some(current);
        }
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_tokens_replace_mask() {
        let mask = parse_bundle_formats("plain").unwrap();
        assert!(mask.plain);
        assert!(!mask.verity);
        assert!(!mask.crypt);
    }

    #[test]
    fn modifying_tokens_adjust_default_mask() {
        let mask = parse_bundle_formats("-crypt").unwrap();
        assert!(mask.plain);
        assert!(mask.verity);
        assert!(!mask.crypt);
    }

    #[test]
    fn mixed_style_is_rejected() {
        assert!(parse_bundle_formats("plain -crypt").is_err());
    }

    #[test]
    fn empty_result_is_rejected() {
        assert!(parse_bundle_formats("-plain -verity -crypt").is_err());
    }

    #[test]
    fn parses_minimal_system_and_slots() {
        let raw = "\
[system]
compatible=test-device
bootloader=uboot

[slot.rootfs.0]
device=/dev/sda1
type=ext4
bootname=A

[slot.rootfs.1]
device=/dev/sda2
type=ext4
bootname=B

[slot.appfs.0]
device=/dev/sda3
type=ext4
parent=rootfs.0
";
        let cfg = SystemConfig::parse(raw).unwrap();
        assert_eq!(cfg.compatible, "test-device");
        assert_eq!(cfg.slots.len(), 3);
        let app0 = cfg.slots.get("appfs.0").unwrap();
        assert_eq!(app0.parent.as_deref(), Some("rootfs.0"));
    }

    #[test]
    fn duplicate_bootname_rejected() {
        let raw = "\
[system]
compatible=test-device
bootloader=uboot

[slot.rootfs.0]
device=/dev/sda1
type=ext4
bootname=A

[slot.rootfs.1]
device=/dev/sda2
type=ext4
bootname=A
";
        assert!(SystemConfig::parse(raw).is_err());
    }

    #[test]
    fn child_with_bootname_rejected() {
        let raw = "\
[system]
compatible=test-device
bootloader=uboot

[slot.rootfs.0]
device=/dev/sda1
type=ext4
bootname=A

[slot.appfs.0]
device=/dev/sda3
type=ext4
parent=rootfs.0
bootname=B
";
        assert!(SystemConfig::parse(raw).is_err());
    }
}
