// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * OTA image persistence.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Image persistence
//!
//! Three layers:
//!
//! - [`BlockDevice`] is raw byte addressable media, either read-modify-write
//!   (EEPROM) or erase-before-write (flash).
//! - [`StorageDriver`] stores a single downloading image on a device and
//!   records download progress in a small meta record.
//!   [`EepromDriver`] and [`PageEraseDriver`] implement the two media kinds.
//! - [`ImageStore`] is the view used by clients and servers: a set of
//!   complete images keyed by [`ImageId`] plus one temporary download.
//!   [`SimpleStore`] holds one image over any driver.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::{ImageRead, OtaHeader, Tags, OTA_FILE_MAGIC, OTA_HEADER_MAX_LEN};
use zigbee_ota::{ImageId, OtaError, Result};

/// Result of an operation that may complete on a later [`poll`](StorageDriver::poll)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Finished
    Done,
    /// Still running, poll again
    InProgress,
}

/// Raw storage media
pub trait BlockDevice {
    /// Device size in bytes
    fn size(&self) -> u32;

    /// Reads `buf.len()` bytes from `offset`
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`
    ///
    /// Erase-before-write devices can only clear bits.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Erase page size, 0 for read-modify-write media
    fn page_size(&self) -> u32 {
        0
    }

    /// Starts erasing the page containing `offset`
    fn erase_page(&mut self, _offset: u32) -> Result<()> {
        Err(OtaError::Storage("erase unsupported"))
    }

    /// Typical page erase duration
    fn page_erase_ms(&self) -> u32 {
        0
    }

    /// Returns whether an erase is still running
    fn busy(&mut self) -> bool {
        false
    }
}

/// Storage of a single downloading image
///
/// Offsets are relative to the start of the OTA file.
pub trait StorageDriver {
    /// Reads stored image bytes
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes image bytes without recording download progress
    fn write_data(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Records that every byte before `offset` has been written
    ///
    /// The driver persists the offset at its own granularity, never
    /// past `offset`.
    fn save_offset(&mut self, offset: u32) -> Result<()>;

    /// Writes image bytes following everything already written
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.write_data(offset, data)?;
        let end = offset
            .checked_add(data.len() as u32)
            .ok_or(OtaError::Storage("write past end of image area"))?;
        self.save_offset(end)
    }

    /// Erases a range of the image area
    fn erase(&mut self, offset: u32, len: u32) -> Result<()>;

    /// Returns the download offset recorded in the meta record
    ///
    /// This never exceeds the number of bytes actually written.
    fn last_stored_offset(&mut self) -> u32;

    /// Records the final offset of a download
    fn finish(&mut self, final_offset: u32) -> Result<()>;

    /// Discards any stored image, resetting the recorded offset to 0
    fn invalidate(&mut self) -> Result<Progress>;

    /// Prepares to continue writing at [`last_stored_offset`](Self::last_stored_offset)
    fn prepare_to_resume(&mut self) -> Result<Progress>;

    /// Largest image that fits
    fn max_download_size(&self) -> u32;

    /// Whether the media must be erased before it is written
    fn requires_erase_before_write(&self) -> bool;

    /// Continues an operation that returned [`Progress::InProgress`]
    fn poll(&mut self, _now: u64) -> Result<Progress> {
        Ok(Progress::Done)
    }
}

/// Meta record layout version
pub const META_VERSION: u16 = 0x0001;
/// Image data offset within an [`EepromDriver`] device
pub const EEPROM_IMAGE_START: u32 = 16;
/// Default interval for persisting the download offset
pub const DEFAULT_SAVE_RATE: u32 = 1000;

const META_LEN: usize = 6;
const EEPROM_OFFSET_INDEX: u32 = 8;
const BYTEMASK_START: u32 = 16;
const OFFSET_UNSET: u32 = 0xFFFF_FFFF;

fn meta_record() -> [u8; META_LEN] {
    let m = OTA_FILE_MAGIC.to_le_bytes();
    let v = META_VERSION.to_le_bytes();
    [m[0], m[1], m[2], m[3], v[0], v[1]]
}

fn meta_valid<D: BlockDevice>(dev: &mut D) -> bool {
    let mut b = [0u8; META_LEN];
    match dev.read(0, &mut b) {
        Ok(()) => b == meta_record(),
        Err(e) => {
            error!("meta record read failed: {e}");
            false
        }
    }
}

fn check_range(offset: u32, len: usize, max: u32) -> Result<()> {
    let end = u32::try_from(len)
        .ok()
        .and_then(|l| offset.checked_add(l))
        .ok_or(OtaError::Storage("out of range"))?;
    if end > max {
        return Err(OtaError::Storage("out of range"));
    }
    Ok(())
}

/// Driver for read-modify-write media
///
/// The download offset is persisted every `save_rate` bytes and on
/// [`finish`](StorageDriver::finish).
pub struct EepromDriver<D> {
    dev: D,
    save_rate: u32,
}

impl<D: BlockDevice> EepromDriver<D> {
    /// Creates a driver with [`DEFAULT_SAVE_RATE`]
    pub fn new(dev: D) -> Self {
        Self::with_save_rate(dev, DEFAULT_SAVE_RATE)
    }

    /// Creates a driver persisting the offset every `save_rate` bytes
    pub fn with_save_rate(dev: D, save_rate: u32) -> Self {
        Self { dev, save_rate }
    }

    /// Returns the underlying device
    pub fn device(&mut self) -> &mut D {
        &mut self.dev
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        let mut b = [0u8; 4];
        self.dev.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn write_u32(&mut self, v: u32, addr: u32) -> Result<()> {
        if self.read_u32(addr)? != v {
            self.dev.write(addr, &v.to_le_bytes())?;
        }
        Ok(())
    }

    fn update_offset(&mut self, offset: u32, final_offset: bool) -> Result<()> {
        let old = self.last_stored_offset();
        if final_offset
            || offset == 0
            || (offset > self.save_rate
                && old.saturating_add(self.save_rate) <= offset)
        {
            trace!("recording download offset {offset}");
            self.write_u32(offset, EEPROM_OFFSET_INDEX)?;
        }
        Ok(())
    }
}

impl<D: BlockDevice> StorageDriver for EepromDriver<D> {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.max_download_size())?;
        self.dev.read(EEPROM_IMAGE_START + offset, buf)
    }

    fn write_data(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.max_download_size())?;
        self.dev.write(EEPROM_IMAGE_START + offset, data)
    }

    fn save_offset(&mut self, offset: u32) -> Result<()> {
        self.update_offset(offset, false)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<()> {
        check_range(offset, len as usize, self.max_download_size())?;
        let ff = [0xffu8; 32];
        let mut o = 0;
        while o < len {
            let l = (len - o).min(ff.len() as u32);
            self.dev.write(EEPROM_IMAGE_START + offset + o, &ff[..l as usize])?;
            o += l;
        }
        Ok(())
    }

    fn last_stored_offset(&mut self) -> u32 {
        if !meta_valid(&mut self.dev) {
            return 0;
        }
        match self.read_u32(EEPROM_OFFSET_INDEX) {
            Ok(OFFSET_UNSET) => 0,
            Ok(o) => o,
            Err(e) => {
                error!("offset read failed: {e}");
                0
            }
        }
    }

    fn finish(&mut self, final_offset: u32) -> Result<()> {
        self.update_offset(final_offset, true)
    }

    fn invalidate(&mut self) -> Result<Progress> {
        if !meta_valid(&mut self.dev) {
            self.dev.write(0, &meta_record())?;
        }
        // OTA magic and header length
        self.write(0, &[0u8; 8])?;
        self.finish(0)?;
        Ok(Progress::Done)
    }

    fn prepare_to_resume(&mut self) -> Result<Progress> {
        Ok(Progress::Done)
    }

    fn max_download_size(&self) -> u32 {
        self.dev.size().saturating_sub(EEPROM_IMAGE_START)
    }

    fn requires_erase_before_write(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct EraseOp {
    current: u32,
    end: u32,
    next_poll: u64,
}

/// Driver for erase-before-write media
///
/// Page 0 holds the meta record. A write-once bytemask after it has one
/// byte per image page, cleared to 0x00 once that page is fully
/// written. Image data starts at page 1.
///
/// Invalidation erases the device one page per [`poll`](StorageDriver::poll).
pub struct PageEraseDriver<D> {
    dev: D,
    page_size: u32,
    /// Index of the last recorded image page, -1 for none
    last_index: Option<i32>,
    erase: Option<EraseOp>,
}

impl<D: BlockDevice> PageEraseDriver<D> {
    /// Creates a driver
    ///
    /// Fails if the device has no erase pages, or the bytemask cannot
    /// cover every page.
    pub fn new(dev: D) -> Result<Self> {
        let page_size = dev.page_size();
        if page_size == 0 || dev.size() % page_size != 0 {
            return Err(OtaError::Storage("bad page size"));
        }
        let image_pages = (dev.size() / page_size).saturating_sub(1);
        let mask_len = page_size
            .checked_sub(BYTEMASK_START)
            .ok_or(OtaError::Storage("page too small for bytemask"))?;
        if image_pages == 0 || mask_len < image_pages {
            return Err(OtaError::Storage("device too small for bytemask"));
        }
        Ok(Self {
            dev,
            page_size,
            last_index: None,
            erase: None,
        })
    }

    /// Returns the underlying device
    pub fn device(&mut self) -> &mut D {
        &mut self.dev
    }

    fn image_pages(&self) -> u32 {
        self.dev.size() / self.page_size - 1
    }

    fn erase_delay(&self) -> u64 {
        (self.dev.page_erase_ms() >> 2).max(1) as u64
    }

    fn start_erase(&mut self, begin: u32, end: u32) -> Result<Progress> {
        if self.erase.is_some() {
            return Err(OtaError::Busy);
        }
        debug!("starting erase 0x{begin:x} to 0x{end:x}");
        self.erase = Some(EraseOp {
            current: begin,
            end,
            next_poll: 0,
        });
        Ok(Progress::InProgress)
    }

    fn read_bytemask_index(&mut self) -> Result<i32> {
        let pages = self.image_pages();
        let mut b = [0u8; 16];
        let mut i = 0;
        while i < pages {
            let l = (pages - i).min(b.len() as u32) as usize;
            self.dev.read(BYTEMASK_START + i, &mut b[..l])?;
            if let Some(p) = b[..l].iter().position(|m| *m == 0xff) {
                return Ok(i as i32 + p as i32 - 1);
            }
            i += l as u32;
        }
        Ok(pages as i32 - 1)
    }

    fn last_index(&mut self) -> Result<i32> {
        if let Some(i) = self.last_index {
            return Ok(i);
        }
        let i = self.read_bytemask_index()?;
        self.last_index = Some(i);
        Ok(i)
    }

    fn index_for_offset(&self, offset: u32) -> i32 {
        (offset / self.page_size) as i32 - 1
    }

    fn update_offset(&mut self, offset: u32, final_offset: bool) -> Result<()> {
        let last = self.last_index()?;
        let mut new = self.index_for_offset(offset);
        if final_offset && new == last {
            new += 1;
        }
        new = new.min(self.image_pages() as i32 - 1);
        if new > last {
            trace!("recording bytemask index {new} (was {last})");
            for i in (last + 1)..=new {
                self.dev.write(BYTEMASK_START + i as u32, &[0])?;
            }
            self.last_index = Some(new);
        }
        Ok(())
    }

    fn erase_range(&mut self, begin: u32, end: u32) -> Result<()> {
        let mut p = begin - begin % self.page_size;
        while p < end {
            self.dev.erase_page(p)?;
            p += self.page_size;
        }
        Ok(())
    }
}

impl<D: BlockDevice> StorageDriver for PageEraseDriver<D> {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.max_download_size())?;
        self.dev.read(self.page_size + offset, buf)
    }

    fn write_data(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if self.erase.is_some() {
            return Err(OtaError::Busy);
        }
        check_range(offset, data.len(), self.max_download_size())?;
        self.dev.write(self.page_size + offset, data)
    }

    fn save_offset(&mut self, offset: u32) -> Result<()> {
        if self.erase.is_some() {
            return Err(OtaError::Busy);
        }
        self.update_offset(offset, false)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<()> {
        check_range(offset, len as usize, self.max_download_size())?;
        let begin = self.page_size + offset;
        self.erase_range(begin, begin + len)
    }

    fn last_stored_offset(&mut self) -> u32 {
        if !meta_valid(&mut self.dev) {
            return 0;
        }
        match self.last_index() {
            Ok(i) => (i + 1) as u32 * self.page_size,
            Err(e) => {
                error!("bytemask read failed: {e}");
                0
            }
        }
    }

    fn finish(&mut self, final_offset: u32) -> Result<()> {
        self.update_offset(final_offset, true)
    }

    fn invalidate(&mut self) -> Result<Progress> {
        self.last_index = Some(-1);
        self.start_erase(0, self.dev.size())
    }

    fn prepare_to_resume(&mut self) -> Result<Progress> {
        let last = self.last_index()?;
        if last < 0 {
            return Err(OtaError::Storage("no recorded pages"));
        }
        // device page following the last recorded image page
        let begin = (last as u32 + 2) * self.page_size;
        if begin >= self.dev.size() {
            return Ok(Progress::Done);
        }
        self.start_erase(begin, begin + self.page_size)
    }

    fn max_download_size(&self) -> u32 {
        self.dev.size() - self.page_size
    }

    fn requires_erase_before_write(&self) -> bool {
        true
    }

    fn poll(&mut self, now: u64) -> Result<Progress> {
        let delay = self.erase_delay();
        let Some(op) = self.erase.as_mut() else {
            return Ok(Progress::Done);
        };
        if now < op.next_poll {
            return Ok(Progress::InProgress);
        }
        if self.dev.busy() {
            op.next_poll = now + delay;
            return Ok(Progress::InProgress);
        }
        if op.current < op.end {
            trace!(
                "erasing page {} of {}",
                op.current / self.page_size + 1,
                op.end / self.page_size
            );
            let r = self.dev.erase_page(op.current);
            op.current += self.page_size;
            op.next_poll = now + delay;
            if let Err(e) = r {
                error!("page erase failed: {e}");
                self.erase = None;
                return Err(e);
            }
            return Ok(Progress::InProgress);
        }

        self.erase = None;
        debug!("erase complete");
        if !meta_valid(&mut self.dev) {
            self.dev.write(0, &meta_record())?;
        }
        Ok(Progress::Done)
    }
}

/// In-memory block device
///
/// With a page size it behaves as flash: writes only clear bits, and
/// pages erase to 0xFF. Otherwise writes overwrite.
pub struct RamDevice<const N: usize> {
    data: [u8; N],
    page_size: u32,
    page_erase_ms: u32,
    busy_polls: u32,
    busy_remaining: u32,
    /// Number of pages erased
    pub erase_count: usize,
    /// Number of writes
    pub write_count: usize,
}

impl<const N: usize> RamDevice<N> {
    /// Creates a read-modify-write device, initially 0xFF
    pub fn new() -> Self {
        Self::with_pages(0, 0)
    }

    /// Creates an erase-before-write device, initially 0xFF
    pub fn with_pages(page_size: u32, page_erase_ms: u32) -> Self {
        Self {
            data: [0xff; N],
            page_size,
            page_erase_ms,
            busy_polls: 0,
            busy_remaining: 0,
            erase_count: 0,
            write_count: 0,
        }
    }

    /// Reports busy for `polls` calls to [`busy`](BlockDevice::busy) after each erase
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    /// Device contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|e| *e <= N)
            .ok_or(OtaError::Storage("device out of range"))?;
        Ok(start..end)
    }
}

impl<const N: usize> Default for RamDevice<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BlockDevice for RamDevice<N> {
    fn size(&self) -> u32 {
        N as u32
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let r = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let r = self.range(offset, data.len())?;
        self.write_count += 1;
        let flash = self.page_size > 0;
        for (d, s) in self.data[r].iter_mut().zip(data) {
            if flash {
                *d &= *s;
            } else {
                *d = *s;
            }
        }
        Ok(())
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn erase_page(&mut self, offset: u32) -> Result<()> {
        if self.page_size == 0 {
            return Err(OtaError::Storage("erase unsupported"));
        }
        let start = offset - offset % self.page_size;
        let r = self.range(start, self.page_size as usize)?;
        self.data[r].fill(0xff);
        self.erase_count += 1;
        self.busy_remaining = self.busy_polls;
        Ok(())
    }

    fn page_erase_ms(&self) -> u32 {
        self.page_erase_ms
    }

    fn busy(&mut self) -> bool {
        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            true
        } else {
            false
        }
    }
}

/// Status of the temporary download area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Nothing downloaded
    None,
    /// Download in progress in this session
    InProgress,
    /// A complete image is present
    Complete,
    /// A partial image from an earlier session is present
    PartialFound,
    /// Storage could not be read
    Error,
}

/// Progress of the temporary download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadState {
    /// Image being downloaded
    pub id: ImageId,
    /// Bytes durably stored
    pub offset: u32,
    /// Total image size
    pub total: u32,
    /// Download status
    pub status: DownloadStatus,
}

impl DownloadState {
    /// No download present
    pub const NONE: Self = Self {
        id: ImageId::INVALID,
        offset: 0,
        total: 0,
        status: DownloadStatus::None,
    };

    pub(crate) fn error() -> Self {
        Self {
            status: DownloadStatus::Error,
            ..Self::NONE
        }
    }
}

/// A set of stored images plus one temporary download
pub trait ImageStore {
    /// How many complete images may be held at once
    fn max_concurrent_images(&self) -> usize;

    /// Number of complete images
    fn count(&mut self) -> usize;

    /// First stored image
    fn first(&mut self) -> Option<ImageId>;

    /// Image following `prev`
    fn next(&mut self, prev: &ImageId) -> Option<ImageId>;

    /// Header of a stored image
    fn header(&mut self, id: &ImageId) -> Result<OtaHeader>;

    /// Total file size of a stored image
    fn total_size(&mut self, id: &ImageId) -> Result<u32> {
        Ok(self.header(id)?.image_size)
    }

    /// Reads from a stored image, returning the length read
    ///
    /// Reads are clamped to the image size.
    fn read(&mut self, id: &ImageId, offset: u32, buf: &mut [u8]) -> Result<usize>;

    /// Removes a stored image
    fn delete(&mut self, id: &ImageId) -> Result<Progress>;

    /// Finds the highest version image for a manufacturer and type
    ///
    /// Images whose hardware range excludes `hardware_version` are skipped.
    fn search(
        &mut self,
        manufacturer_id: u16,
        image_type: u16,
        hardware_version: Option<u16>,
    ) -> Option<ImageId> {
        let pattern = ImageId::new(
            manufacturer_id,
            image_type,
            ImageId::WILDCARD_VERSION,
        );
        let mut best: Option<ImageId> = None;
        let mut cur = self.first();
        while let Some(id) = cur {
            if id.matches(&pattern) {
                let hw_ok = self
                    .header(&id)
                    .map(|h| h.hardware_ok(hardware_version))
                    .unwrap_or(false);
                let newer = best
                    .map(|b| id.firmware_version > b.firmware_version)
                    .unwrap_or(true);
                if hw_ok && newer {
                    best = Some(id);
                }
            }
            cur = self.next(&id);
        }
        best
    }

    /// Discards the temporary download
    fn clear_temp(&mut self) -> Result<Progress>;

    /// Writes to the temporary download without recording progress
    ///
    /// Used for data that may follow bytes not yet received.
    fn write_temp_unsaved(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Records that every byte of the download before `offset` is written
    ///
    /// [`check_temp`](Self::check_temp) never reports more than the
    /// largest offset recorded.
    fn save_temp_offset(&mut self, offset: u32) -> Result<()>;

    /// Writes to the temporary download, following everything already
    /// written
    fn write_temp(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.write_temp_unsaved(offset, data)?;
        let end = offset
            .checked_add(data.len() as u32)
            .ok_or(OtaError::Storage("write past end of image area"))?;
        self.save_temp_offset(end)
    }

    /// Reports what the temporary download area holds
    fn check_temp(&mut self) -> DownloadState;

    /// Prepares to continue a partial download
    fn prepare_to_resume(&mut self) -> Result<Progress>;

    /// Marks the temporary download finished at `offset`
    ///
    /// A complete image becomes visible through [`first`](Self::first).
    fn finish_download(&mut self, offset: u32) -> Result<()>;

    /// Largest image that may be downloaded
    fn max_download_size(&self) -> u32;

    /// Continues an operation that returned [`Progress::InProgress`]
    fn poll(&mut self, _now: u64) -> Result<Progress> {
        Ok(Progress::Done)
    }

    /// Returns a reader for a stored image
    fn image(&mut self, id: ImageId) -> StoredImage<'_, Self>
    where
        Self: Sized,
    {
        StoredImage { store: self, id }
    }
}

/// Reads one stored image through [`ImageRead`]
pub struct StoredImage<'a, S: ?Sized> {
    store: &'a mut S,
    id: ImageId,
}

impl<S: ImageStore + ?Sized> StoredImage<'_, S> {
    /// Reads the image's header
    pub fn header(&mut self) -> Result<OtaHeader> {
        self.store.header(&self.id)
    }

    /// Lists the image's tags
    pub fn tags(&mut self) -> Result<Tags> {
        let h = self.header()?;
        crate::enumerate_tags(self, &h)
    }

    /// Returns the offset and length of a tag's data
    pub fn tag_offset_and_size(&mut self, tag_id: u16) -> Result<(u32, u32)> {
        let h = self.header()?;
        crate::tag_offset_and_size(self, &h, tag_id)
    }

    /// Reads a tag's data
    pub fn tag_data(&mut self, tag_id: u16, buf: &mut [u8]) -> Result<usize> {
        let h = self.header()?;
        crate::tag_data(self, &h, tag_id, buf)
    }
}

impl<S: ImageStore + ?Sized> ImageRead for StoredImage<'_, S> {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        self.store.read(&self.id, offset, buf)
    }
}

/// Single image store over a [`StorageDriver`]
///
/// The temporary download and the stored image share the same space.
/// Once fully downloaded the image is listed as stored.
pub struct SimpleStore<S> {
    driver: S,
}

impl<S: StorageDriver> SimpleStore<S> {
    /// Creates a store
    pub fn new(driver: S) -> Self {
        Self { driver }
    }

    /// Returns the underlying driver
    pub fn driver(&mut self) -> &mut S {
        &mut self.driver
    }

    fn stored_header(&mut self) -> Result<OtaHeader> {
        let mut b = [0u8; OTA_HEADER_MAX_LEN as usize];
        let l = (self.driver.max_download_size() as usize).min(b.len());
        self.driver.read(0, &mut b[..l])?;
        OtaHeader::parse(&b[..l])
    }

    /// Header of the complete stored image
    fn full_header(&mut self) -> Option<OtaHeader> {
        let h = self.stored_header().ok()?;
        (self.driver.last_stored_offset() >= h.image_size).then_some(h)
    }

    fn full_header_for(&mut self, id: &ImageId) -> Result<OtaHeader> {
        match self.full_header() {
            Some(h) if h.id().same_triplet(id) => Ok(h),
            _ => Err(OtaError::NotFound),
        }
    }
}

impl<S: StorageDriver> ImageStore for SimpleStore<S> {
    fn max_concurrent_images(&self) -> usize {
        1
    }

    fn count(&mut self) -> usize {
        self.full_header().is_some() as usize
    }

    fn first(&mut self) -> Option<ImageId> {
        self.full_header().map(|h| h.id())
    }

    fn next(&mut self, _prev: &ImageId) -> Option<ImageId> {
        None
    }

    fn header(&mut self, id: &ImageId) -> Result<OtaHeader> {
        self.full_header_for(id)
    }

    fn read(&mut self, id: &ImageId, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let h = self.full_header_for(id)?;
        let avail = h.image_size.saturating_sub(offset) as usize;
        let l = avail.min(buf.len());
        if l > 0 {
            self.driver.read(offset, &mut buf[..l])?;
        }
        Ok(l)
    }

    fn delete(&mut self, id: &ImageId) -> Result<Progress> {
        self.full_header_for(id)?;
        info!("deleting image {id}");
        self.driver.invalidate()
    }

    fn clear_temp(&mut self) -> Result<Progress> {
        self.driver.invalidate()
    }

    fn write_temp_unsaved(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.driver.write_data(offset, data)
    }

    fn save_temp_offset(&mut self, offset: u32) -> Result<()> {
        self.driver.save_offset(offset)
    }

    fn check_temp(&mut self) -> DownloadState {
        let offset = self.driver.last_stored_offset();
        if offset == 0 {
            return DownloadState::NONE;
        }
        if offset <= crate::OTA_HEADER_MIN_LEN as u32 {
            debug!("partial download too short to resume");
            return DownloadState::NONE;
        }
        match self.stored_header() {
            Ok(h) => {
                let status = if offset >= h.image_size {
                    DownloadStatus::Complete
                } else {
                    DownloadStatus::PartialFound
                };
                DownloadState {
                    id: h.id(),
                    offset: offset.min(h.image_size),
                    total: h.image_size,
                    status,
                }
            }
            Err(e) => {
                warn!("stored download has a bad header: {e}");
                DownloadState::error()
            }
        }
    }

    fn prepare_to_resume(&mut self) -> Result<Progress> {
        self.driver.prepare_to_resume()
    }

    fn finish_download(&mut self, offset: u32) -> Result<()> {
        self.driver.finish(offset)
    }

    fn max_download_size(&self) -> u32 {
        self.driver.max_download_size()
    }

    fn poll(&mut self, now: u64) -> Result<Progress> {
        self.driver.poll(now)
    }
}
