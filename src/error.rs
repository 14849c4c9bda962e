//! Tagged error kinds for every stage of the install pipeline.
//!
//! Errors are tagged, not inherited: each stage has its own leaf enum, and
//! a top-level [`Error`] unions them and carries a prefix trail so a
//! caller can see both the leaf kind and the chain of operations that
//! propagated it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("bundle format not recognized")]
    Identifier,
    #[error("signature error: {0}")]
    Signature(String),
    #[error("no keyring configured")]
    Keyring,
    #[error("bundle format '{0}' not allowed by policy")]
    Format(String),
    #[error("bundle failed exclusivity check: {0}")]
    Unsafe(String),
    #[error("verity hash tree verification failed")]
    Verity,
    #[error("payload content does not match verified hash")]
    Payload,
    #[error("decryption failed: {0}")]
    Crypt(String),
    #[error("unknown bundle format field '{0}'")]
    UnknownFormat(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("parent slot '{0}' not found")]
    Parent(String),
    #[error("slot '{0}' has a parent loop")]
    ParentLoop(String),
    #[error("child slot '{0}' must not have a bootname")]
    ChildHasBootname(String),
    #[error("bootname '{0}' is set on more than one slot")]
    DuplicateBootname(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("unsupported slot type '{0}' for slot {1}")]
    SlotType(String, String),
    #[error("invalid device for slot {0}: {1}")]
    InvalidDevice(String, String),
    #[error("invalid max-bundle-download-size: {0}")]
    MaxBundleDownloadSize(String),
    #[error("invalid data directory: {0}")]
    DataDirectory(String),
    #[error("unknown bootloader '{0}'")]
    Bootloader(String),
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest has no data")]
    NoData,
    #[error("checksum missing or invalid for image '{0}'")]
    Checksum(String),
    #[error("compatible string mismatch: expected '{expected}', got '{got}'")]
    Compatible { expected: String, got: String },
    #[error("failed to parse manifest: {0}")]
    Parse(String),
    #[error("empty string not allowed for key '{0}'")]
    EmptyString(String),
    #[error("manifest consistency check failed: {0}")]
    Check(String),
}

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("no slot configuration found")]
    NoConfig,
    #[error("could not find any root device or slot information on the boot command line")]
    NoBootslot,
    #[error("did not find a slot with state booted (matching '{0}')")]
    NoSlotWithStateBooted(String),
    #[error("slot operation failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("install failed: {0}")]
    Failed(String),
    #[error("install-check hook rejected the bundle: {0}")]
    RejectedHook(String),
    #[error("could not map image '{image}' to a target slot: {reason}")]
    ImageMapping { image: String, reason: String },
    #[error("slot '{0}' is read-only")]
    ReadonlySlot(String),
    #[error("handler failed: {0}")]
    Handler(String),
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("no handler registered for image kind '{image_kind}' on slot type '{slot_type}'")]
    NoHandler {
        image_kind: String,
        slot_type: String,
    },
}

/// Top-level error type unifying every stage, plus prefix-chained context.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error("{0}: {1}")]
    Context(String, Box<Error>),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Extension trait for prefixing an error with an operation name as it
/// bubbles up, mirroring the original's prefixed-error propagation.
pub trait Contextual<T> {
    fn context(self, prefix: impl Into<String>) -> Result<T>;
}

impl<T, E> Contextual<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, prefix: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context(prefix.into(), Box::new(e.into())))
    }
}

impl Error {
    /// Returns the leaf kind name, ignoring any context wrapping, for
    /// user-visible reporting (RPC reply / CLI exit code / event log).
    pub fn leaf_kind(&self) -> &'static str {
        match self {
            Error::Bundle(_) => "BUNDLE",
            Error::Config(_) => "CONFIG",
            Error::Manifest(_) => "MANIFEST",
            Error::Slot(_) => "SLOT",
            Error::Install(_) => "INSTALL",
            Error::Update(_) => "UPDATE",
            Error::Context(_, inner) => inner.leaf_kind(),
            Error::Io(_) => "IO",
            Error::Other(_) => "OTHER",
        }
    }

    /// Renders the full prefix trail followed by the leaf message, in the
    /// order it was propagated (outermost context first).
    pub fn trail(&self) -> String {
        match self {
            Error::Context(prefix, inner) => format!("{}: {}", prefix, inner.trail()),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chain_renders_prefix_trail() {
        let err: Result<()> = Err(SlotError::NoBootslot.into());
        let err = err.context("loading boot state").unwrap_err();
        assert_eq!(err.leaf_kind(), "SLOT");
        assert!(err.trail().starts_with("loading boot state: "));
    }
}
