//! Hook-script delegation: when an image's `install` hook flag is set,
//! the handler is always a subprocess call to the configured hook
//! script rather than any built-in writer, regardless of the inferred
//! file kind.

use crate::error::{InstallError, Result};
use crate::manifest::Image;
use crate::slot::Slot;

use super::{source_path, HandlerContext};

pub fn write(image: &Image, slot: &Slot, ctx: &HandlerContext) -> Result<()> {
    let source = source_path(ctx, image);
    let source_str = source.to_string_lossy().to_string();
    let out = ctx
        .runner
        .run("rauc-hook", &["install", &source_str, &slot.device, &slot.name], None)?;
    if !out.success() {
        let message = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(InstallError::Handler(if message.is_empty() {
            format!("hook script exited with status {}", out.exit_code)
        } else {
            message
        })
        .into());
    }
    Ok(())
}
