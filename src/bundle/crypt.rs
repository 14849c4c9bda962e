//! dm-crypt stacking for CRYPT-format bundles: aes-cbc-plain64, 256-bit
//! key taken from the manifest. Stacked on top of the dm-verity target
//! so the mount sees a single plaintext, integrity-checked block device.

use devicemapper::{DevId, DmName, DmOptions, DM};
use tracing::info;

use crate::error::{Error, Result};

pub struct CryptTarget {
    name: String,
    active: bool,
}

impl CryptTarget {
    pub fn new(name: impl Into<String>) -> Self {
        CryptTarget {
            name: name.into(),
            active: false,
        }
    }

    pub fn setup(&mut self, backing_device: &str, key: &[u8], sectors: u64) -> Result<()> {
        if self.active {
            return Ok(());
        }
        if key.len() != 32 {
            return Err(Error::Other(format!(
                "dm-crypt key must be 256 bits, got {} bytes",
                key.len()
            )));
        }
        let dm = dm_error(DM::new())?;
        let dm_name = dm_error(DmName::new(&self.name))?;
        let id = DevId::Name(dm_name);
        let table = format!("0 {} crypt aes-cbc-plain64 {} 0 {} 0", sectors, hex::encode(key), backing_device);
        dm_error(dm.device_create(dm_name, None, DmOptions::default()))?;
        dm_error(dm.table_load(&id, &[(0, sectors, "crypt".to_string(), table)], DmOptions::default()))?;
        dm_error(dm.device_suspend(&id, DmOptions::default()))?;
        self.active = true;
        info!(name = %self.name, "dm-crypt target active");
        Ok(())
    }

    pub fn remove(&mut self, deferred: bool) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let dm = dm_error(DM::new())?;
        let dm_name = dm_error(DmName::new(&self.name))?;
        let id = DevId::Name(dm_name);
        let opts = if deferred {
            DmOptions::default().set_flags(devicemapper::DmFlags::DM_DEFERRED_REMOVE)
        } else {
            DmOptions::default()
        };
        dm_error(dm.device_remove(&id, &opts))?;
        self.active = false;
        Ok(())
    }
}

fn dm_error<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> Result<T> {
    result.map_err(|e| Error::Other(format!("devicemapper: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_keys() {
        let mut t = CryptTarget::new("test-crypt");
        let err = t.setup("/dev/loop0", &[0u8; 16], 1024).unwrap_err();
        assert!(format!("{}", err).contains("256 bits"));
    }

    #[test]
    fn remove_before_setup_is_a_no_op() {
        let mut t = CryptTarget::new("test-crypt");
        assert!(t.remove(true).is_ok());
    }
}
