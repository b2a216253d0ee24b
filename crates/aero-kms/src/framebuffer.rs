//! Framebuffers and their reference counts.

use tracing::error;

use crate::object::{BoHandle, FbId};

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Scanout pixel formats accepted by the primary plane and overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    C8,
    Rgb565,
    Xrgb8888,
    Argb8888,
    Xbgr8888,
    Abgr8888,
    Xrgb2101010,
    Argb2101010,
    Xbgr2101010,
    Abgr2101010,
    Xrgb1555,
    Argb1555,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 12] = [
        PixelFormat::C8,
        PixelFormat::Rgb565,
        PixelFormat::Xrgb8888,
        PixelFormat::Argb8888,
        PixelFormat::Xbgr8888,
        PixelFormat::Abgr8888,
        PixelFormat::Xrgb2101010,
        PixelFormat::Argb2101010,
        PixelFormat::Xbgr2101010,
        PixelFormat::Abgr2101010,
        PixelFormat::Xrgb1555,
        PixelFormat::Argb1555,
    ];

    pub const fn fourcc(self) -> u32 {
        match self {
            PixelFormat::C8 => fourcc(b'C', b'8', b' ', b' '),
            PixelFormat::Rgb565 => fourcc(b'R', b'G', b'1', b'6'),
            PixelFormat::Xrgb8888 => fourcc(b'X', b'R', b'2', b'4'),
            PixelFormat::Argb8888 => fourcc(b'A', b'R', b'2', b'4'),
            PixelFormat::Xbgr8888 => fourcc(b'X', b'B', b'2', b'4'),
            PixelFormat::Abgr8888 => fourcc(b'A', b'B', b'2', b'4'),
            PixelFormat::Xrgb2101010 => fourcc(b'X', b'R', b'3', b'0'),
            PixelFormat::Argb2101010 => fourcc(b'A', b'R', b'3', b'0'),
            PixelFormat::Xbgr2101010 => fourcc(b'X', b'B', b'3', b'0'),
            PixelFormat::Abgr2101010 => fourcc(b'A', b'B', b'3', b'0'),
            PixelFormat::Xrgb1555 => fourcc(b'X', b'R', b'1', b'5'),
            PixelFormat::Argb1555 => fourcc(b'A', b'R', b'1', b'5'),
        }
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == code)
    }

    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::C8 => 1,
            PixelFormat::Rgb565 | PixelFormat::Xrgb1555 | PixelFormat::Argb1555 => 2,
            _ => 4,
        }
    }
}

/// Framebuffer metadata. `format` is a raw fourcc so unsupported formats can be represented and
/// rejected at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: u32,
    pub bo: BoHandle,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, bo: BoHandle) -> Self {
        Self {
            width,
            height,
            pitch: width * format.bytes_per_pixel(),
            format: format.fourcc(),
            bo,
        }
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.format)
    }
}

#[derive(Debug)]
struct FbEntry {
    fb: Framebuffer,
    refcount: u32,
    /// The creator dropped its handle; the entry lives on only while states reference it.
    removed: bool,
}

/// Arena of framebuffers with explicit reference counting.
///
/// The creator holds one reference from [`FbTable::add`] until [`FbTable::remove`]. Every state
/// object that points at a framebuffer holds one more (taken in `duplicate`, dropped in
/// `destroy`).
#[derive(Debug, Default)]
pub struct FbTable {
    entries: Vec<Option<FbEntry>>,
}

impl FbTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fb: Framebuffer) -> FbId {
        let entry = FbEntry {
            fb,
            refcount: 1,
            removed: false,
        };
        let slot = match self.entries.iter().position(Option::is_none) {
            Some(slot) => {
                self.entries[slot] = Some(entry);
                slot
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        FbId(slot as u32 + 1)
    }

    /// Drop the creator's reference. Returns false if the id is unknown or already removed.
    pub fn remove(&mut self, id: FbId) -> bool {
        match self.entry_mut(id) {
            Some(entry) if !entry.removed => {
                entry.removed = true;
            }
            _ => return false,
        }
        self.put(id);
        true
    }

    /// Look up a framebuffer that is still available for new references.
    pub fn lookup(&self, id: FbId) -> Option<&Framebuffer> {
        self.entry(id).filter(|e| !e.removed).map(|e| &e.fb)
    }

    /// Look up a framebuffer that may already be removed but is still referenced.
    pub fn get_any(&self, id: FbId) -> Option<&Framebuffer> {
        self.entry(id).map(|e| &e.fb)
    }

    pub fn refcount(&self, id: FbId) -> u32 {
        self.entry(id).map_or(0, |e| e.refcount)
    }

    pub fn get(&mut self, id: FbId) {
        match self.entry_mut(id) {
            Some(entry) => entry.refcount += 1,
            None => error!(fb = id.0, "reference taken on unknown framebuffer"),
        }
    }

    pub fn put(&mut self, id: FbId) {
        let Some(slot) = Self::slot(id) else {
            error!(fb = id.0, "reference dropped on invalid framebuffer id");
            return;
        };
        let Some(entry) = self.entries.get_mut(slot).and_then(Option::as_mut) else {
            error!(fb = id.0, "reference dropped on unknown framebuffer");
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            self.entries[slot] = None;
        }
    }

    fn slot(id: FbId) -> Option<usize> {
        (id.0 as usize).checked_sub(1)
    }

    fn entry(&self, id: FbId) -> Option<&FbEntry> {
        Self::slot(id).and_then(|s| self.entries.get(s)?.as_ref())
    }

    fn entry_mut(&mut self, id: FbId) -> Option<&mut FbEntry> {
        Self::slot(id).and_then(|s| self.entries.get_mut(s)?.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_match_the_drm_encoding() {
        assert_eq!(PixelFormat::Xrgb8888.fourcc(), 0x3432_5258);
        assert_eq!(
            PixelFormat::from_fourcc(0x3432_5258),
            Some(PixelFormat::Xrgb8888)
        );
        // NV12 is not a scanout format here.
        assert_eq!(PixelFormat::from_fourcc(fourcc(b'N', b'V', b'1', b'2')), None);
    }

    #[test]
    fn removed_framebuffer_lives_while_referenced() {
        let mut fbs = FbTable::new();
        let id = fbs.add(Framebuffer::new(64, 64, PixelFormat::Argb8888, BoHandle(7)));
        fbs.get(id);
        assert_eq!(fbs.refcount(id), 2);

        assert!(fbs.remove(id));
        assert!(!fbs.remove(id), "second remove is rejected");
        assert!(fbs.lookup(id).is_none());
        assert_eq!(fbs.get_any(id).map(|fb| fb.bo), Some(BoHandle(7)));

        fbs.put(id);
        assert_eq!(fbs.refcount(id), 0);
        assert!(fbs.get_any(id).is_none());
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut fbs = FbTable::new();
        let a = fbs.add(Framebuffer::new(1, 1, PixelFormat::C8, BoHandle(1)));
        let _b = fbs.add(Framebuffer::new(1, 1, PixelFormat::C8, BoHandle(2)));
        fbs.remove(a);
        let c = fbs.add(Framebuffer::new(1, 1, PixelFormat::C8, BoHandle(3)));
        assert_eq!(c, a);
    }
}
