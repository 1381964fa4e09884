//! DSK and Extended DSK (EDSK) disk-image container handling.
//!
//! Both formats share a 256-byte Disk Information Block followed by one
//! Track Information Block per formatted track. Standard DSK tracks all
//! occupy the same number of bytes (the `TrackSize` word at $32); EDSK
//! tracks vary, with per-track sizes (in 256-byte units) tabulated from
//! $34 and per-sector byte lengths in each Sector Information entry.
//!
//! This crate provides the flat-buffer layout constants, read/write views
//! over the two block types, and [`edsk_to_dsk`], which repacks an EDSK
//! image into uniform DSK track slots so a controller can address tracks
//! with plain `base + index * TrackSize` arithmetic.
//!
//! # Layout
//!
//! | offset | Disk Information Block |
//! |--------|------------------------|
//! | $00    | signature (34 bytes)   |
//! | $30    | number of tracks       |
//! | $31    | number of sides        |
//! | $32    | track size, u16 LE (standard DSK) |
//! | $34    | per-track size table, 1 byte per track in 256-byte units (EDSK) |
//!
//! | offset | Track Information Block |
//! |--------|-------------------------|
//! | $00    | `"Track-Info\r\n"`      |
//! | $10    | track number            |
//! | $11    | side number             |
//! | $14    | sector size code (N)    |
//! | $15    | number of sectors       |
//! | $16    | gap #3 length           |
//! | $17    | filler byte             |
//! | $18    | sector info list, 8 bytes per sector (C, H, R, N, ST1, ST2, length u16 LE) |
//! | $100   | sector data             |

use std::fmt;

/// Signature at the start of a standard DSK image.
pub const STANDARD_SIGNATURE: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
/// Signature at the start of an extended DSK image.
pub const EXTENDED_SIGNATURE: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
/// First 10 bytes of every Track Information Block.
pub const TRACK_SIGNATURE: &[u8] = b"Track-Info";

/// Size of the Disk Information Block.
pub const DISK_INFO_LEN: usize = 0x100;
/// Bytes per Sector Information entry.
pub const SECTOR_INFO_LEN: usize = 8;
/// Fixed in-memory size of a Track Information Block scratch buffer:
/// $18 header + 232-byte sector info list + 32 KiB of sector data.
pub const TRACK_BLOCK_LEN: usize = 0x18 + 232 + 32768;

/// Disk Information Block field offsets.
pub const OFF_NUM_TRACKS: usize = 0x30;
pub const OFF_NUM_SIDES: usize = 0x31;
pub const OFF_TRACK_SIZE: usize = 0x32;
pub const OFF_TRACK_SIZE_TABLE: usize = 0x34;

/// Track Information Block field offsets.
pub const OFF_TRACK_NUM: usize = 0x10;
pub const OFF_SIDE_NUM: usize = 0x11;
pub const OFF_SECTOR_SIZE: usize = 0x14;
pub const OFF_NUM_SECTORS: usize = 0x15;
pub const OFF_GAP_LENGTH: usize = 0x16;
pub const OFF_FILLER_BYTE: usize = 0x17;
pub const OFF_SECTOR_INFO_LIST: usize = 0x18;
pub const OFF_SECTOR_DATA: usize = 0x100;

#[derive(Debug)]
pub enum DskError {
    /// The normalized image could not be allocated (requested size in bytes).
    Alloc(usize),
}

impl fmt::Display for DskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(size) => {
                write!(f, "could not allocate {size} bytes for normalized DSK image")
            }
        }
    }
}

impl std::error::Error for DskError {}

/// True when the image carries the extended-format signature.
///
/// Only the first byte is significant: every standard DSK starts with `'M'`,
/// every extended one with `'E'`.
#[must_use]
pub fn is_extended(image: &[u8]) -> bool {
    image.first() == Some(&b'E')
}

/// A copy of the 256-byte Disk Information Block.
#[derive(Clone)]
pub struct DiskInfo {
    raw: [u8; DISK_INFO_LEN],
}

impl DiskInfo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            raw: [0; DISK_INFO_LEN],
        }
    }

    /// Copy the header from the start of an image. Short images leave the
    /// remainder zero-filled.
    pub fn load(&mut self, image: &[u8]) {
        self.raw.fill(0);
        let n = image.len().min(DISK_INFO_LEN);
        self.raw[..n].copy_from_slice(&image[..n]);
    }

    #[must_use]
    pub fn num_tracks(&self) -> u8 {
        self.raw[OFF_NUM_TRACKS]
    }

    #[must_use]
    pub fn num_sides(&self) -> u8 {
        self.raw[OFF_NUM_SIDES]
    }

    #[must_use]
    pub fn track_size(&self) -> u16 {
        u16::from_le_bytes([self.raw[OFF_TRACK_SIZE], self.raw[OFF_TRACK_SIZE + 1]])
    }
}

impl Default for DiskInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry of a track's Sector Information List.
///
/// `data_len` is the actual stored byte length (meaningful for EDSK
/// sources, where it may differ from `128 << n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorInfo {
    pub c: u8,
    pub h: u8,
    pub r: u8,
    pub n: u8,
    pub st1: u8,
    pub st2: u8,
    pub data_len: u16,
}

/// Scratch buffer holding one Track Information Block.
///
/// A controller loads the track the head is over into this buffer, works
/// on it, and (after a write) stores it back to the image. All accessors
/// are bounds-clamped: offsets beyond the block read as zero and writes
/// beyond it are dropped, so a malformed image can never push an access
/// outside the buffer.
pub struct TrackBuf {
    raw: Box<[u8]>,
}

impl TrackBuf {
    #[must_use]
    pub fn new() -> Self {
        Self {
            raw: vec![0; TRACK_BLOCK_LEN].into_boxed_slice(),
        }
    }

    /// Copy up to `len` bytes of track data from `image[offset..]`.
    ///
    /// Bytes past the end of the image or the block are left untouched,
    /// matching a real controller's scratch RAM keeping stale content.
    pub fn load(&mut self, image: &[u8], offset: usize, len: usize) {
        let len = len.min(TRACK_BLOCK_LEN);
        let avail = image.len().saturating_sub(offset).min(len);
        if avail > 0 {
            self.raw[..avail].copy_from_slice(&image[offset..offset + avail]);
        }
    }

    /// Copy up to `len` bytes of this block back into `image[offset..]`.
    pub fn store(&self, image: &mut [u8], offset: usize, len: usize) {
        let len = len.min(TRACK_BLOCK_LEN);
        let avail = image.len().saturating_sub(offset).min(len);
        if avail > 0 {
            image[offset..offset + avail].copy_from_slice(&self.raw[..avail]);
        }
    }

    /// Whether the block starts with the `"Track-Info"` signature, i.e.
    /// the loaded track is formatted.
    #[must_use]
    pub fn has_signature(&self) -> bool {
        &self.raw[..TRACK_SIGNATURE.len()] == TRACK_SIGNATURE
    }

    #[must_use]
    pub fn track_num(&self) -> u8 {
        self.raw[OFF_TRACK_NUM]
    }

    #[must_use]
    pub fn side_num(&self) -> u8 {
        self.raw[OFF_SIDE_NUM]
    }

    /// Sector size code (N) shared by every sector of the track.
    #[must_use]
    pub fn sector_size(&self) -> u8 {
        self.raw[OFF_SECTOR_SIZE]
    }

    #[must_use]
    pub fn num_sectors(&self) -> u8 {
        self.raw[OFF_NUM_SECTORS]
    }

    #[must_use]
    pub fn gap_length(&self) -> u8 {
        self.raw[OFF_GAP_LENGTH]
    }

    #[must_use]
    pub fn filler_byte(&self) -> u8 {
        self.raw[OFF_FILLER_BYTE]
    }

    /// Decode the Sector Information entry at `index`.
    #[must_use]
    pub fn sector_info(&self, index: usize) -> SectorInfo {
        self.sector_info_at(OFF_SECTOR_INFO_LIST + index * SECTOR_INFO_LEN)
    }

    /// Decode a Sector Information entry at an arbitrary byte offset.
    ///
    /// Controllers walk the list with a moving cursor rather than an
    /// index, so the offset form is the primitive.
    #[must_use]
    pub fn sector_info_at(&self, offset: usize) -> SectorInfo {
        let b = |i: usize| self.raw.get(offset + i).copied().unwrap_or(0);
        SectorInfo {
            c: b(0),
            h: b(1),
            r: b(2),
            n: b(3),
            st1: b(4),
            st2: b(5),
            data_len: u16::from_le_bytes([b(6), b(7)]),
        }
    }

    /// Single byte read, zero beyond the block.
    #[must_use]
    pub fn byte(&self, offset: usize) -> u8 {
        self.raw.get(offset).copied().unwrap_or(0)
    }

    /// Single byte write, dropped beyond the block.
    pub fn set_byte(&mut self, offset: usize, value: u8) {
        if let Some(slot) = self.raw.get_mut(offset) {
            *slot = value;
        }
    }

    /// Copy block content starting at `offset` into `dst`. Bytes past
    /// the end of the block leave `dst` untouched.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        let avail = self.raw.len().saturating_sub(offset).min(dst.len());
        if avail > 0 {
            dst[..avail].copy_from_slice(&self.raw[offset..offset + avail]);
        }
    }

    /// Copy `data` into the block's sector-data region at `offset`,
    /// clamped to the block. Used by tests and image builders.
    pub fn fill(&mut self, offset: usize, data: &[u8]) {
        let end = (offset + data.len()).min(TRACK_BLOCK_LEN);
        if end > offset {
            self.raw[offset..end].copy_from_slice(&data[..end - offset]);
        }
    }
}

impl Default for TrackBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Repack an extended DSK image into a standard-layout DSK buffer.
///
/// Every track of the output occupies exactly `max(track sizes) * 256`
/// bytes, so track offsets become uniform. The per-track size table is
/// consumed; the `TrackSize` word of the output header is set to the
/// uniform slot size. Tracks with a zero size entry are left as
/// zero-filled slots (unformatted). Sector data keeps its EDSK byte
/// lengths, packed back-to-back from offset $100 of each slot, so the
/// Sector Information List lengths remain authoritative.
///
/// Truncated or otherwise degenerate sources are accepted; reads past the
/// end of the source are treated as absent data.
///
/// # Errors
///
/// [`DskError::Alloc`] when the output buffer cannot be allocated. The
/// source is untouched in that case.
pub fn edsk_to_dsk(src: &[u8]) -> Result<Vec<u8>, DskError> {
    let byte = |off: usize| src.get(off).copied().unwrap_or(0);

    let num_tracks = byte(OFF_NUM_TRACKS);
    let num_sides = byte(OFF_NUM_SIDES);
    let entries = usize::from(num_tracks) * usize::from(num_sides);

    let max_blocks = (0..entries)
        .map(|i| byte(OFF_TRACK_SIZE_TABLE + i))
        .max()
        .unwrap_or(0);
    let max_track_len = usize::from(max_blocks) << 8;

    // Slack beyond the computed size; some images understate their track
    // sizes and the controller writes whole track blocks back.
    let total = entries * max_track_len + DISK_INFO_LEN + 100_000;

    let mut dst: Vec<u8> = Vec::new();
    dst.try_reserve_exact(total)
        .map_err(|_| DskError::Alloc(total))?;
    dst.resize(total, 0);

    // Creator field carries over; signature and unused header bytes stay zero.
    copy_clamped(&mut dst, 0x22, src, 0x22, 14);
    dst[OFF_NUM_TRACKS] = num_tracks;
    dst[OFF_NUM_SIDES] = num_sides;
    dst[OFF_TRACK_SIZE..OFF_TRACK_SIZE + 2]
        .copy_from_slice(&(max_track_len as u16).to_le_bytes());

    let mut src_off = DISK_INFO_LEN;
    for i in 0..entries {
        let blocks = byte(OFF_TRACK_SIZE_TABLE + i);
        if blocks == 0 {
            // Unformatted track: no data in the source, slot stays zeroed.
            continue;
        }

        let dst_off = DISK_INFO_LEN + i * max_track_len;
        let num_sectors = usize::from(byte(src_off + OFF_NUM_SECTORS));
        if num_sectors > 0 {
            // Track header and sector info list keep their layout.
            copy_clamped(
                &mut dst,
                dst_off,
                src,
                src_off,
                OFF_SECTOR_INFO_LIST + num_sectors * SECTOR_INFO_LEN,
            );

            // Sector data: variable lengths in the source, packed
            // back-to-back in both; only the slot stride changes.
            let mut data_src = src_off + OFF_SECTOR_DATA;
            let mut data_dst = dst_off + OFF_SECTOR_DATA;
            for k in 0..num_sectors {
                let entry = src_off + OFF_SECTOR_INFO_LIST + k * SECTOR_INFO_LEN;
                let len = usize::from(u16::from_le_bytes([byte(entry + 6), byte(entry + 7)]));
                if len > 0 {
                    copy_clamped(&mut dst, data_dst, src, data_src, len);
                    data_src += len;
                }
                data_dst += len;
            }
        }

        src_off += usize::from(blocks) << 8;
    }

    Ok(dst)
}

/// Copy `len` bytes between buffers, silently dropping whatever falls
/// outside either one.
fn copy_clamped(dst: &mut [u8], dst_off: usize, src: &[u8], src_off: usize, len: usize) {
    let n = len
        .min(src.len().saturating_sub(src_off))
        .min(dst.len().saturating_sub(dst_off));
    if n > 0 {
        dst[dst_off..dst_off + n].copy_from_slice(&src[src_off..src_off + n]);
    }
}
