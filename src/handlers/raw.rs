//! Raw/filesystem-image write handler: stream bytes straight onto a
//! block slot, verify the written length, fsync.

use std::fs::OpenOptions;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::manifest::Image;
use crate::slot::Slot;

use super::{resize_if_needed, source_path, HandlerContext};

pub fn write(image: &Image, slot: &Slot, ctx: &HandlerContext) -> Result<()> {
    let source = source_path(ctx, image);
    let mut reader = std::fs::File::open(&source).map_err(Error::Io)?;
    let mut out = OpenOptions::new()
        .write(true)
        .open(&slot.device)
        .map_err(Error::Io)?;

    let mut buf = [0u8; 1 << 20];
    let mut written: u64 = 0;
    loop {
        let n = reader.read(&mut buf).map_err(Error::Io)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(Error::Io)?;
        written += n as u64;
    }

    if written != image.checksum.size {
        return Err(Error::Other(format!(
            "wrote {} bytes to {} but image declares size {}",
            written, slot.device, image.checksum.size
        )));
    }

    out.flush().map_err(Error::Io)?;
    out.sync_all().map_err(Error::Io)?;

    resize_if_needed(ctx.runner, slot)?;
    Ok(())
}
