//! The slot data model: storage regions the bootloader can select between.
//!
//! Grounded on the teacher's `bootloader/bootcontrol.rs` slot-index model,
//! generalized from a fixed two-slot A/B scheme to the class/redundancy
//! graph the bundle format requires.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::status::SlotStatus;

/// Runtime state of a slot, filled in by [`crate::planner::determine_slot_states`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unknown,
    Inactive,
    Active,
    Booted,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Unknown => "unknown",
            SlotState::Inactive => "inactive",
            SlotState::Active => "active",
            SlotState::Booted => "booted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "inactive" => SlotState::Inactive,
            "active" => SlotState::Active,
            "booted" => SlotState::Booted,
            _ => SlotState::Unknown,
        }
    }
}

/// Filesystem-ish type tag of a slot, determining which update handler
/// and mount behavior applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotType {
    Raw,
    Ext4,
    Ubifs,
    Ubivol,
    Nand,
    Vfat,
    /// The synthetic slot created for `_external_`/`/dev/nfs` boots.
    Virtual,
    Other(String),
}

impl SlotType {
    pub fn parse(s: &str) -> Self {
        match s {
            "raw" => SlotType::Raw,
            "ext4" => SlotType::Ext4,
            "ubifs" => SlotType::Ubifs,
            "ubivol" => SlotType::Ubivol,
            "nand" => SlotType::Nand,
            "vfat" => SlotType::Vfat,
            "virtual" => SlotType::Virtual,
            other => SlotType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SlotType::Raw => "raw",
            SlotType::Ext4 => "ext4",
            SlotType::Ubifs => "ubifs",
            SlotType::Ubivol => "ubivol",
            SlotType::Nand => "nand",
            SlotType::Vfat => "vfat",
            SlotType::Virtual => "virtual",
            SlotType::Other(s) => s,
        }
    }

    /// Whether the kernel can mount this slot type directly (used to
    /// decide whether a filesystem-based handler, rather than a raw
    /// block copy, applies).
    pub fn is_mountable(&self) -> bool {
        matches!(self, SlotType::Ext4 | SlotType::Ubifs | SlotType::Vfat)
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, SlotType::Other(_))
    }
}

/// A single storage region, identified by `class.index` (e.g. `rootfs.0`).
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub class: String,
    pub device: String,
    pub fstype: SlotType,
    pub bootname: Option<String>,
    /// Resolved to the *root* slot's name after grandparent normalization;
    /// `None` means this slot is itself a root.
    pub parent: Option<String>,
    pub readonly: bool,
    pub install_same: bool,
    pub resize: bool,
    pub allow_mounted: bool,
    pub extra_mount_opts: Option<String>,
    pub region_start: Option<u64>,
    pub region_size: Option<u64>,
    pub state: SlotState,
    pub mount_point: Option<String>,
    pub status: Option<SlotStatus>,
    pub boot_good: bool,
}

impl Slot {
    pub fn new(name: impl Into<String>, class: impl Into<String>, device: impl Into<String>) -> Self {
        Slot {
            name: name.into(),
            class: class.into(),
            device: device.into(),
            fstype: SlotType::Raw,
            bootname: None,
            parent: None,
            readonly: false,
            install_same: false,
            resize: false,
            allow_mounted: false,
            extra_mount_opts: None,
            region_start: None,
            region_size: None,
            state: SlotState::Unknown,
            mount_point: None,
            status: None,
            boot_good: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// The full slot table: an insertion-ordered map so iteration over a
/// class's members is deterministic (first-declared-first), matching the
/// config file's declaration order.
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    order: Vec<String>,
    slots: BTreeMap<String, Slot>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: Slot) {
        if !self.slots.contains_key(&slot.name) {
            self.order.push(slot.name.clone());
        }
        self.slots.insert(slot.name.clone(), slot);
    }

    pub fn get(&self, name: &str) -> Option<&Slot> {
        self.slots.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Slot> {
        self.slots.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.order.iter().filter_map(|n| self.slots.get(n))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.values_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Every class with at least one slot that has no parent.
    pub fn root_classes(&self) -> Vec<String> {
        let mut out = Vec::new();
        for s in self.iter() {
            if s.is_root() && !out.contains(&s.class) {
                out.push(s.class.clone());
            }
        }
        out
    }

    /// All slots (root or child) belonging to `class`, in declaration order.
    pub fn all_of_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a Slot> {
        self.iter().filter(move |s| s.class == class)
    }

    /// All root slots belonging to `class`, in declaration order.
    pub fn roots_of_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a Slot> {
        self.all_of_class(class).filter(|s| s.is_root())
    }

    /// All direct children of the given root slot name.
    pub fn children_of<'a>(&'a self, root_name: &'a str) -> impl Iterator<Item = &'a Slot> {
        self.iter()
            .filter(move |s| s.parent.as_deref() == Some(root_name))
    }

    /// Resolve a slot's ultimate root slot name (itself if it's a root).
    pub fn root_of<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        let slot = self.get(name)?;
        Some(slot.parent.as_deref().unwrap_or(name))
    }

    /// Find a slot whose `device` path names the same underlying object
    /// (block device or regular file) as `device`, even via a different
    /// path. Grounded on the C source's `normalize_mountable_object`.
    pub fn find_by_device(&self, device: &str) -> Option<&Slot> {
        let target = MountableObj::stat(device);
        for s in self.iter() {
            if s.device == device {
                return Some(s);
            }
            if let (Some(a), Some(b)) = (&target, MountableObj::stat(&s.device)) {
                if a.same_as(&b) {
                    return Some(s);
                }
            }
        }
        None
    }

    pub fn find_by_bootname(&self, bootname: &str) -> Option<&Slot> {
        self.iter().find(|s| s.bootname.as_deref() == Some(bootname))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Slot> {
        self.get(name)
    }
}

/// Identity of whatever a path resolves to for the purpose of recognizing
/// "same slot, different path" (bind mounts, by-id symlinks, etc).
struct MountableObj {
    is_device: bool,
    dev: u64,
    ino: u64,
}

impl MountableObj {
    fn stat(path: &str) -> Option<Self> {
        let meta = fs::metadata(Path::new(path)).ok()?;
        let file_type = meta.file_type();
        if file_type.is_block_device() {
            Some(MountableObj {
                is_device: true,
                dev: meta.rdev(),
                ino: 0,
            })
        } else if file_type.is_file() {
            Some(MountableObj {
                is_device: false,
                dev: meta.dev(),
                ino: meta.ino(),
            })
        } else {
            None
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        self.is_device == other.is_device
            && self.dev == other.dev
            && (self.is_device || self.ino == other.ino)
    }
}

use std::os::unix::fs::FileTypeExt;

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(names_and_parents: &[(&str, &str, Option<&str>)]) -> SlotTable {
        let mut t = SlotTable::new();
        for (name, class, parent) in names_and_parents {
            let mut s = Slot::new(*name, *class, format!("/dev/{}", name));
            s.parent = parent.map(|p| p.to_string());
            t.insert(s);
        }
        t
    }

    #[test]
    fn root_classes_excludes_children() {
        let t = table_with(&[
            ("rootfs.0", "rootfs", None),
            ("appfs.0", "appfs", Some("rootfs.0")),
        ]);
        assert_eq!(t.root_classes(), vec!["rootfs".to_string()]);
    }

    #[test]
    fn children_of_filters_by_parent() {
        let t = table_with(&[
            ("rootfs.0", "rootfs", None),
            ("rootfs.1", "rootfs", None),
            ("appfs.0", "appfs", Some("rootfs.0")),
            ("appfs.1", "appfs", Some("rootfs.1")),
        ]);
        let kids: Vec<_> = t.children_of("rootfs.0").map(|s| s.name.clone()).collect();
        assert_eq!(kids, vec!["appfs.0".to_string()]);
    }
}
