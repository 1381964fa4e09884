//! Per-drive state: the mounted image, head position latches, and the
//! scratch track block the controller works on.

use format_dsk::{DISK_INFO_LEN, DiskInfo, TRACK_BLOCK_LEN, TrackBuf, edsk_to_dsk, is_extended};

/// One floppy drive unit.
///
/// The unit owns its disk image. Extended DSK images are normalized into
/// standard DSK layout on insert, after which the image is addressed with
/// uniform track offsets and treated as read-only.
pub(crate) struct DiskUnit {
    /// Mounted image in standard DSK layout, `None` when empty.
    pub(crate) image: Option<Vec<u8>>,
    pub(crate) inserted: bool,
    pub(crate) write_protect: bool,
    /// Set on any sector write, cleared on insert.
    pub(crate) contents_changed: bool,
    /// The mounted image came from an EDSK file; sector lengths come from
    /// the Sector Information List and the image is write-protected.
    pub(crate) edsk_source: bool,
    /// Ready-line change latch: set on insert, cleared when the host
    /// acknowledges it through Sense Interrupt Status.
    pub(crate) drive_state_changed: bool,
    /// Physical cylinder the head is over.
    pub(crate) ctk: u8,
    /// Head selected by the last command.
    pub(crate) chead: u8,
    /// Index of the physical sector the head is over, within the current
    /// track's sector list. 0xFF means "before the first sector".
    pub(crate) csr: u8,
    /// Latched by Seek/Recalibrate, cleared by Sense Interrupt Status.
    pub(crate) seek_done: bool,
    /// Copy of the image's Disk Information Block.
    pub(crate) disk_info: DiskInfo,
    /// Scratch Track Information Block for the current (ctk, chead).
    pub(crate) track: TrackBuf,
}

impl DiskUnit {
    pub(crate) fn new() -> Self {
        Self {
            image: None,
            inserted: false,
            write_protect: false,
            contents_changed: false,
            edsk_source: false,
            drive_state_changed: false,
            ctk: 0,
            chead: 0,
            csr: 0,
            seek_done: false,
            disk_info: DiskInfo::new(),
            track: TrackBuf::new(),
        }
    }

    /// Mount an image. EDSK sources are normalized first; if the
    /// normalized buffer cannot be allocated the unit stays empty.
    pub(crate) fn insert(&mut self, image: Vec<u8>, write_protect: bool) {
        self.eject();
        self.edsk_source = false;
        self.contents_changed = false;
        self.write_protect = write_protect;
        self.drive_state_changed = true;

        let image = if is_extended(&image) {
            let Ok(normalized) = edsk_to_dsk(&image) else {
                return;
            };
            self.edsk_source = true;
            self.write_protect = true;
            normalized
        } else {
            image
        };

        self.disk_info.load(&image);
        self.image = Some(image);
        self.inserted = true;
    }

    pub(crate) fn eject(&mut self) {
        self.image = None;
        self.inserted = false;
    }

    /// Byte offset of the current track's block within the image.
    ///
    /// Tracks are laid out sequentially after the 256-byte header; on
    /// double-sided images the two heads' tracks interleave.
    pub(crate) fn track_offset(&self) -> usize {
        let track_size = usize::from(self.disk_info.track_size());
        let mut offset = usize::from(self.ctk) * track_size;
        if self.disk_info.num_sides() == 2 {
            offset *= 2;
            if self.chead == 1 {
                offset += track_size;
            }
        }
        offset + DISK_INFO_LEN
    }

    /// Length of one track block copy: the image's track size, clamped to
    /// the scratch buffer.
    fn track_copy_len(&self) -> usize {
        usize::from(self.disk_info.track_size()).min(TRACK_BLOCK_LEN)
    }

    /// Load the current track into the scratch block and validate its
    /// signature. Returns false for unformatted or missing tracks.
    pub(crate) fn load_track(&mut self) -> bool {
        let Some(image) = self.image.as_ref() else {
            return false;
        };
        let offset = self.track_offset();
        self.track.load(image, offset, self.track_copy_len());
        self.track.has_signature()
    }

    /// Write the scratch block back to the image and mark the disk dirty.
    pub(crate) fn store_track(&mut self) {
        self.contents_changed = true;
        let offset = self.track_offset();
        let len = self.track_copy_len();
        if let Some(image) = self.image.as_mut() {
            self.track.store(image, offset, len);
        }
    }
}
