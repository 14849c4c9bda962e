//! Filesystem-image write handler: a full filesystem image (ext4,
//! squashfs, ...) written directly to a mountable slot, then optionally
//! resized to fill the slot.

use crate::error::Result;
use crate::manifest::Image;
use crate::slot::Slot;

use super::{raw, HandlerContext};

/// Mountable slots accept a ready-made filesystem image via the same
/// streaming write as a raw block slot; the distinction from `raw` is
/// only that `resize` is meaningful here since the destination is a
/// real filesystem, not an opaque block range.
pub fn write(image: &Image, slot: &Slot, ctx: &HandlerContext) -> Result<()> {
    raw::write(image, slot, ctx)
}
