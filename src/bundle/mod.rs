//! Bundle container parsing and verification: locating the trailing
//! signature, checking exclusivity, verifying the CMS signature, and
//! (for verity/crypt) the payload hash tree, per the on-disk layout in
//! the system configuration's bundle format policy.
//!
//! Grounded on the teacher's `mount::verity` dm-verity entry point
//! (rewritten here: the teacher's version referenced an undefined error
//! variant and used the `log` crate directly) and enriched with CMS
//! handling from `containers-bootc`/`bootupd`'s use of `openssl` for
//! digesting and verifying signed artifacts.

pub mod crypt;
pub mod mount;
pub mod signature;
pub mod verity;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::{debug, warn};

use crate::bundle::mount::{ActiveMount, MountManager};
use crate::config::{BundleFormatMask, KeyringConfig};
use crate::error::{BundleError, Error, Result};
use crate::manifest::{BundleFormat, Manifest};
use crate::subprocess::Runner;

/// Maximum signature trailer size; the later, authoritative value per the
/// source's own open question (an older revision used 64 MiB).
pub const MAX_BUNDLE_SIGNATURE_SIZE: u64 = 0x10000;

const TRAILER_LEN: u64 = 8;
const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Unverified,
    SignatureVerified,
    PayloadVerified,
}

pub struct Bundle {
    pub path: String,
    pub file_size: u64,
    pub payload_size: u64,
    pub signature: Vec<u8>,
    pub was_encrypted: bool,
    pub manifest: Manifest,
    pub mount_point: Option<String>,
    pub state: VerificationState,
    pub exclusive_verified: bool,
    active_mount: Option<ActiveMount>,
}

/// Options controlling how a bundle is opened, separate from the
/// persistent system configuration so callers (tests, `mark`-adjacent
/// tooling) can override keyring/format policy per call.
pub struct OpenOptions<'a> {
    pub allowed_formats: BundleFormatMask,
    pub keyring: &'a KeyringConfig,
    pub trust_env: bool,
    pub decrypt_key: Option<&'a [u8]>,
    /// Where to loop-mount a PLAIN bundle's payload to read its
    /// manifest. Unused for VERITY/CRYPT, whose manifest is read
    /// straight out of the signed CMS content.
    pub mount_prefix: &'a Path,
    pub runner: &'a dyn Runner,
}

impl Bundle {
    /// Runs the full open-and-verify pipeline against a local file.
    pub fn open(path: &str, opts: &OpenOptions) -> Result<Self> {
        let mut file = File::open(path).map_err(Error::Io)?;
        let file_size = file.metadata().map_err(Error::Io)?.len();

        if file_size < TRAILER_LEN {
            return Err(BundleError::Identifier.into());
        }

        let sig_size = read_trailer(&mut file, file_size)?;
        if sig_size == 0 || sig_size >= file_size - TRAILER_LEN || sig_size > MAX_BUNDLE_SIGNATURE_SIZE {
            return Err(BundleError::Signature(format!(
                "invalid signature size {} (file size {})",
                sig_size, file_size
            ))
            .into());
        }

        let payload_size = file_size - TRAILER_LEN - sig_size;
        if payload_size % BLOCK_SIZE != 0 {
            warn!(path, payload_size, "payload size not a multiple of 4096 bytes");
        }

        let sig_offset = file_size - TRAILER_LEN - sig_size;
        let mut sig_bytes = vec![0u8; sig_size as usize];
        file.seek(SeekFrom::Start(sig_offset)).map_err(Error::Io)?;
        file.read_exact(&mut sig_bytes).map_err(Error::Io)?;

        let exclusive_verified = check_exclusivity(path, &file, opts.trust_env)?;

        let (content, was_encrypted) = if signature::is_enveloped(&sig_bytes)? {
            let key = opts
                .decrypt_key
                .ok_or_else(|| BundleError::Crypt("bundle is encrypted but no decryption key configured".to_string()))?;
            (signature::decrypt(&sig_bytes, key)?, true)
        } else {
            (sig_bytes.clone(), false)
        };

        // Re-check exclusivity right before trusting the payload; a
        // TOCTOU window exists between the signature read above and here.
        let exclusive_verified = exclusive_verified && check_exclusivity(path, &file, opts.trust_env)?;
        if !exclusive_verified {
            return Err(BundleError::Unsafe("bundle failed exclusivity check".to_string()).into());
        }

        // VERITY/CRYPT sign the manifest inline (the CMS carries its own
        // content); PLAIN signs the payload bytes detached, so the CMS
        // carries no content of its own and the manifest has to be read
        // off the mounted payload afterwards. Try the inline case first;
        // if the CMS has no embedded content to verify, fall back to a
        // detached verify against the payload bytes.
        let (manifest, active_mount) = match signature::verify(&content, opts.keyring, None) {
            Ok(inline_content) => {
                let manifest = Manifest::parse(&String::from_utf8_lossy(&inline_content))
                    .map_err(|e| BundleError::Format(format!("inline manifest is not valid: {}", e)))?;
                (manifest, None)
            }
            Err(_) => {
                let mut payload = vec![0u8; payload_size as usize];
                file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
                file.read_exact(&mut payload).map_err(Error::Io)?;
                signature::verify(&content, opts.keyring, Some(&payload))?;

                let tag = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "bundle".to_string());
                let mgr = MountManager::new(opts.mount_prefix);
                let active = mgr.mount_bundle(opts.runner, &tag, path, payload_size, BundleFormat::Plain, None, None)?;

                let manifest_path = active.mount_point.join("manifest.raucm");
                let raw = std::fs::read_to_string(&manifest_path).map_err(Error::Io)?;
                let manifest = match Manifest::parse(&raw) {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = mgr.teardown(opts.runner, active);
                        return Err(e);
                    }
                };
                (manifest, Some(active))
            }
        };

        check_format_allowed(manifest.bundle_format, opts.allowed_formats)?;

        let mount_point = active_mount.as_ref().map(|m| m.mount_point.to_string_lossy().to_string());

        Ok(Bundle {
            path: path.to_string(),
            file_size,
            payload_size,
            signature: content,
            was_encrypted,
            manifest,
            mount_point,
            state: VerificationState::SignatureVerified,
            exclusive_verified,
            active_mount,
        })
    }

    /// Unmounts and releases any payload mount set up during `open`
    /// (PLAIN bundles only; VERITY/CRYPT bundles mount separately via
    /// `MountManager` once payload verification has run).
    pub fn close(mut self, runner: &dyn Runner) -> Result<()> {
        if let Some(active) = self.active_mount.take() {
            let mgr = MountManager::new(active.mount_point.parent().unwrap_or(Path::new("/")));
            mgr.teardown(runner, active)?;
        }
        Ok(())
    }

    /// Verifies the payload against the manifest's verity parameters.
    /// Only meaningful for VERITY/CRYPT bundles; PLAIN bundles are
    /// payload-verified as part of signature verification itself.
    pub fn verify_payload(&mut self, salt: &[u8], root_hash: &[u8]) -> Result<()> {
        if self.manifest.bundle_format == BundleFormat::Plain {
            self.state = VerificationState::PayloadVerified;
            return Ok(());
        }
        let mut file = File::open(&self.path).map_err(Error::Io)?;
        let computed = verity::compute_root_hash(&mut file, self.payload_size, salt)?;
        if computed != root_hash {
            return Err(BundleError::Payload.into());
        }
        self.state = VerificationState::PayloadVerified;
        debug!(path = %self.path, "payload verified against verity root hash");
        Ok(())
    }
}

fn read_trailer(file: &mut File, file_size: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(file_size - TRAILER_LEN)).map_err(Error::Io)?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(u64::from_be_bytes(buf))
}

/// Hard-coded allow-list of filesystem magic numbers considered
/// trustworthy for bundle exclusivity purposes (values match
/// `statfs(2)`'s `f_type` for the listed filesystems).
const TRUSTED_FS_MAGIC: &[i64] = &[
    0x01021994, // tmpfs
    0x858458f6, // ramfs
    0x00c0ffee, // hostfs (illustrative placeholder, matches no real kernel constant)
    0x794c7630, // overlayfs
    0x2fc12fc1, // zfs
    0x24051905, // ubifs
    0xef53,     // ext2/3/4
];
const NFS_MAGIC: i64 = 0x6969;
const FUSE_MAGIC: i64 = 0x65735546;

fn check_exclusivity(path: &str, file: &File, trust_env: bool) -> Result<bool> {
    if trust_env {
        return Ok(true);
    }
    let meta = file.metadata().map_err(Error::Io)?;
    if !meta.is_file() {
        return Ok(false);
    }
    let our_uid = unsafe { libc::geteuid() };
    if meta.uid() != 0 && meta.uid() != our_uid {
        return Ok(false);
    }
    if meta.mode() & 0o777 & !0o755 != 0 {
        return Ok(false);
    }

    let fs_type = statfs_magic(path)?;
    if fs_type == NFS_MAGIC || fs_type == FUSE_MAGIC {
        return Ok(false);
    }
    if !TRUSTED_FS_MAGIC.contains(&fs_type) {
        // Not explicitly distrusted and not explicitly trusted: only the
        // root filesystem itself is implicitly trusted beyond the list.
        let root_fs_type = statfs_magic("/").unwrap_or(0);
        if fs_type != root_fs_type {
            return Ok(false);
        }
    }

    Ok(acquire_lease(file))
}

fn statfs_magic(path: &str) -> Result<i64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path).map_err(|e| Error::Other(e.to_string()))?;
    let mut stat: MaybeUninit<libc::statfs> = MaybeUninit::uninit();
    let ret = unsafe { libc::statfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let stat = unsafe { stat.assume_init() };
    Ok(stat.f_type as i64)
}

fn acquire_lease(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    unsafe { libc::fcntl(fd, libc::F_SETLEASE, libc::F_RDLCK) == 0 }
}

fn check_format_allowed(format: BundleFormat, mask: BundleFormatMask) -> Result<()> {
    let allowed = match format {
        BundleFormat::Plain => mask.plain,
        BundleFormat::Verity => mask.verity,
        BundleFormat::Crypt => mask.crypt,
    };
    if allowed {
        Ok(())
    } else {
        Err(BundleError::Format(format.as_str().to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::mock::MockRunner;
    use std::io::Write;

    fn write_bundle(dir: &Path, payload: &[u8], sig: &[u8]) -> String {
        let path = dir.join("bundle.raucb");
        let mut f = File::create(&path).unwrap();
        f.write_all(payload).unwrap();
        f.write_all(sig).unwrap();
        f.write_all(&(sig.len() as u64).to_be_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn trailer_zero_signature_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &[0u8; 4096], &[]);
        let keyring = KeyringConfig {
            path: None,
            directory: None,
            check_crl: false,
            allowed_signer_names: vec![],
        };
        let runner = MockRunner::ok();
        let opts = OpenOptions {
            allowed_formats: BundleFormatMask::all(),
            keyring: &keyring,
            trust_env: true,
            decrypt_key: None,
            mount_prefix: dir.path(),
            runner: &runner,
        };
        let err = Bundle::open(&path, &opts).unwrap_err();
        assert_eq!(err.leaf_kind(), "BUNDLE");
    }

    #[test]
    fn trailer_oversized_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let oversized = vec![0u8; (MAX_BUNDLE_SIGNATURE_SIZE as usize) + 1];
        let path = write_bundle(dir.path(), &[0u8; 4096], &oversized);
        let keyring = KeyringConfig {
            path: None,
            directory: None,
            check_crl: false,
            allowed_signer_names: vec![],
        };
        let runner = MockRunner::ok();
        let opts = OpenOptions {
            allowed_formats: BundleFormatMask::all(),
            keyring: &keyring,
            trust_env: true,
            decrypt_key: None,
            mount_prefix: dir.path(),
            runner: &runner,
        };
        let err = Bundle::open(&path, &opts).unwrap_err();
        assert_eq!(err.leaf_kind(), "BUNDLE");
    }

    #[test]
    fn trailer_signature_consuming_whole_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // sig_size == file_size - 8 leaves zero payload bytes: rejected
        // directly by the boundary check, never reaching verification.
        let sig = vec![0xABu8; 128];
        let path = write_bundle(dir.path(), &[], &sig);
        let keyring = KeyringConfig {
            path: None,
            directory: None,
            check_crl: false,
            allowed_signer_names: vec![],
        };
        let runner = MockRunner::ok();
        let opts = OpenOptions {
            allowed_formats: BundleFormatMask::all(),
            keyring: &keyring,
            trust_env: true,
            decrypt_key: None,
            mount_prefix: dir.path(),
            runner: &runner,
        };
        let err = Bundle::open(&path, &opts).unwrap_err();
        assert_eq!(err.leaf_kind(), "BUNDLE");
    }
}
