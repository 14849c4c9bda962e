//! The bundle manifest: the list of images and hooks shipped inside a
//! bundle, plus the internal/external consistency checks run on it.

use crate::error::{ManifestError, Result};
use crate::keyfile::KeyFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleFormat {
    Plain,
    Verity,
    Crypt,
}

impl BundleFormat {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "plain" => BundleFormat::Plain,
            "verity" => BundleFormat::Verity,
            "crypt" => BundleFormat::Crypt,
            other => return Err(ManifestError::Parse(format!("unknown bundle format '{}'", other)).into()),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BundleFormat::Plain => "plain",
            BundleFormat::Verity => "verity",
            BundleFormat::Crypt => "crypt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChecksumInfo {
    pub algo: String,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SlotHooks {
    pub pre_install: bool,
    pub install: bool,
    pub post_install: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InstallHooks {
    pub install_check: bool,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub slot_class: String,
    pub filename: String,
    pub checksum: ChecksumInfo,
    /// `None` means this image applies regardless of device variant.
    pub variant: Option<String>,
    pub hooks: SlotHooks,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub compatible: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub build: Option<String>,
    pub bundle_format: BundleFormat,
    pub hooks: InstallHooks,
    /// Preserves the order images were declared in, which matters for the
    /// default install sequencing (root classes before their children).
    pub images: Vec<Image>,
}

impl Manifest {
    pub fn parse(contents: &str) -> Result<Self> {
        let kf = KeyFile::parse(contents).map_err(|e| ManifestError::Parse(e.to_string()))?;

        let compatible = non_empty(&kf, "update", "compatible")?
            .ok_or_else(|| ManifestError::EmptyString("compatible".to_string()))?;
        let version = non_empty(&kf, "update", "version")?;
        let description = non_empty(&kf, "update", "description")?;
        let build = non_empty(&kf, "update", "build")?;

        let bundle_format = match kf.get_string("bundle", "format") {
            Some(s) => BundleFormat::parse(s)?,
            None => BundleFormat::Plain,
        };

        let hooks = InstallHooks {
            install_check: kf
                .get_bool("hooks", "install-check")
                .map_err(|e| ManifestError::Parse(e.to_string()))?
                .unwrap_or(false),
        };

        let mut images = Vec::new();
        for group in kf.groups() {
            let Some(rest) = group.strip_prefix("image.") else {
                continue;
            };
            // [image.CLASS] or [image.CLASS.VARIANT]: the variant, if
            // any, is encoded in the group name itself, not a separate
            // key. Split on the first dot only, since CLASS itself
            // never contains one.
            let (slot_class, variant) = match rest.split_once('.') {
                Some((class, variant)) => (class.to_string(), Some(variant.to_string())),
                None => (rest.to_string(), None),
            };
            let filename = kf
                .get_string(group, "filename")
                .ok_or_else(|| ManifestError::Parse(format!("image '{}' has no filename=", group)))?
                .to_string();
            let digest = kf
                .get_string(group, "sha256")
                .ok_or_else(|| ManifestError::Checksum(slot_class.clone()))?
                .to_string();
            let size = kf
                .get_u64(group, "size")
                .map_err(|e| ManifestError::Parse(e.to_string()))?
                .ok_or_else(|| ManifestError::Checksum(slot_class.clone()))?;
            let install_hooks = SlotHooks {
                pre_install: kf.get_bool(group, "hooks-pre-install").ok().flatten().unwrap_or(false),
                install: kf.get_bool(group, "hooks-install").ok().flatten().unwrap_or(false),
                post_install: kf.get_bool(group, "hooks-post-install").ok().flatten().unwrap_or(false),
            };

            images.push(Image {
                slot_class,
                filename,
                checksum: ChecksumInfo {
                    algo: "sha256".to_string(),
                    digest,
                    size,
                },
                variant,
                hooks: install_hooks,
            });
        }

        let manifest = Manifest {
            compatible,
            version,
            description,
            build,
            bundle_format,
            hooks,
            images,
        };
        manifest.check_internal()?;
        Ok(manifest)
    }

    /// Checks that can be run on the manifest alone, without reference to
    /// the running system (duplicate images per class+variant, non-empty
    /// digests).
    fn check_internal(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(ManifestError::Check("manifest declares no images".to_string()).into());
        }
        for image in &self.images {
            if image.checksum.digest.is_empty() {
                return Err(ManifestError::Checksum(image.slot_class.clone()).into());
            }
            let dup = self.images.iter().any(|other| {
                !std::ptr::eq(other, image)
                    && other.slot_class == image.slot_class
                    && other.variant == image.variant
            });
            if dup {
                return Err(ManifestError::Check(format!(
                    "duplicate image for slot class '{}' variant {:?}",
                    image.slot_class, image.variant
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Checks that require the running system's compatible string, run
    /// once the bundle has been opened against the local configuration.
    pub fn check_external(&self, system_compatible: &str) -> Result<()> {
        if self.compatible != system_compatible {
            return Err(ManifestError::Compatible {
                expected: system_compatible.to_string(),
                got: self.compatible.clone(),
            }
            .into());
        }
        Ok(())
    }
}

fn non_empty(kf: &KeyFile, group: &str, key: &str) -> Result<Option<String>> {
    match kf.get_string(group, key) {
        None => Ok(None),
        Some("") => Err(ManifestError::EmptyString(key.to_string()).into()),
        Some(s) => Ok(Some(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
[update]
compatible=test-device
version=1.0

[bundle]
format=verity

[image.rootfs]
filename=rootfs.img
sha256=deadbeef
size=1048576
";

    #[test]
    fn parses_minimal_manifest() {
        let m = Manifest::parse(MINIMAL).unwrap();
        assert_eq!(m.compatible, "test-device");
        assert_eq!(m.bundle_format, BundleFormat::Verity);
        assert_eq!(m.images.len(), 1);
    }

    #[test]
    fn rejects_empty_compatible() {
        let raw = "[update]\ncompatible=\n\n[image.rootfs]\nfilename=a\nsha256=b\nsize=1\n";
        assert!(Manifest::parse(raw).is_err());
    }

    #[test]
    fn rejects_duplicate_images_for_same_class_and_variant() {
        let raw = "\
[update]
compatible=test-device

[image.rootfs]
filename=rootfs.img
sha256=aaaa
size=10

[image.rootfs.2]
filename=rootfs2.img
sha256=bbbb
size=10
";
        // image.rootfs has variant None, image.rootfs.2 has variant
        // Some("2"); different variants for the same class do not
        // collide.
        let m = Manifest::parse(raw).unwrap();
        assert_eq!(m.images.len(), 2);
    }

    #[test]
    fn group_name_variant_splits_into_class_and_variant() {
        let raw = "\
[update]
compatible=test-device

[image.rootfs]
filename=rootfs.img
sha256=aaaa
size=10

[image.rootfs.variant-a]
filename=rootfs-a.img
sha256=bbbb
size=10
";
        let m = Manifest::parse(raw).unwrap();
        assert_eq!(m.images.len(), 2);
        let base = m.images.iter().find(|i| i.filename == "rootfs.img").unwrap();
        assert_eq!(base.slot_class, "rootfs");
        assert_eq!(base.variant, None);
        let variant = m.images.iter().find(|i| i.filename == "rootfs-a.img").unwrap();
        assert_eq!(variant.slot_class, "rootfs");
        assert_eq!(variant.variant.as_deref(), Some("variant-a"));
    }

    #[test]
    fn variant_with_embedded_dot_is_not_re_split() {
        let raw = "\
[update]
compatible=test-device

[image.rootfs.variant-a.dup]
filename=rootfs-a-dup.img
sha256=aaaa
size=10
";
        let m = Manifest::parse(raw).unwrap();
        assert_eq!(m.images[0].slot_class, "rootfs");
        assert_eq!(m.images[0].variant.as_deref(), Some("variant-a.dup"));
    }
}
