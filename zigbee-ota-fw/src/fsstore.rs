// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Directory backed OTA image store.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Filesystem image store
//!
//! Every parseable `*.ota` file in a directory is served as a stored
//! image. Downloads are written to `download.tmp` and renamed into
//! place once complete. The count of bytes known to be written in
//! sequence is kept alongside in `download.offset`.

#[allow(unused)]
use log::{debug, info, trace, warn};

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::store::{DownloadState, DownloadStatus, ImageStore, Progress};
use crate::{read_header, OtaHeader, OTA_HEADER_MIN_LEN};
use zigbee_ota::{ImageId, OtaError, Result};

/// Temporary download file name
pub const TEMP_FILENAME: &str = "download.tmp";
/// Saved download offset file name
pub const OFFSET_FILENAME: &str = "download.offset";

#[derive(Debug)]
struct Entry {
    header: OtaHeader,
    path: PathBuf,
}

/// Multi-image store over a directory
#[derive(Debug)]
pub struct FsStore {
    dir: PathBuf,
    images: Vec<Entry>,
    max_download_size: u32,
}

/// File name for a finished image
pub fn image_filename(id: &ImageId) -> String {
    format!(
        "{:04X}-{:04X}-{:08X}.ota",
        id.manufacturer_id, id.image_type, id.firmware_version
    )
}

impl FsStore {
    /// Opens a store, loading images from `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let mut s = Self {
            dir: dir.as_ref().to_path_buf(),
            images: Vec::new(),
            max_download_size: u32::MAX,
        };
        s.reload()?;
        Ok(s)
    }

    /// Limits the size of downloads
    pub fn set_max_download_size(&mut self, max: u32) {
        self.max_download_size = max;
    }

    /// Directory holding images
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a stored image
    pub fn path(&self, id: &ImageId) -> Option<&Path> {
        self.entry(id).map(|e| e.path.as_path())
    }

    /// Rescans the directory
    ///
    /// Files that fail to parse are skipped.
    pub fn reload(&mut self) -> Result<()> {
        self.images.clear();
        let rd = std::fs::read_dir(&self.dir)
            .map_err(|_| OtaError::Storage("can't read image directory"))?;
        let mut paths: Vec<PathBuf> = rd
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|x| x == "ota"))
            .collect();
        paths.sort();

        for path in paths {
            match Self::load(&path) {
                Ok(header) => self.insert(Entry { header, path }),
                Err(e) => {
                    warn!("skipping {}: {e}", path.display());
                }
            }
        }
        info!(
            "loaded {} images from {}",
            self.images.len(),
            self.dir.display()
        );
        Ok(())
    }

    fn load(path: &Path) -> Result<OtaHeader> {
        let mut f = File::open(path)
            .map_err(|_| OtaError::Storage("can't open image"))?;
        let header = read_header(&mut f)?;
        let len = f
            .metadata()
            .map_err(|_| OtaError::Storage("can't stat image"))?
            .len();
        if len < header.image_size as u64 {
            return Err(OtaError::Format("File shorter than image size"));
        }
        trace!("{}: {}", path.display(), header.id());
        Ok(header)
    }

    fn insert(&mut self, e: Entry) {
        let id = e.header.id();
        if let Some(old) = self.images.iter_mut().find(|o| o.header.id() == id)
        {
            debug!("{} replaces {}", e.path.display(), old.path.display());
            *old = e;
        } else {
            self.images.push(e);
        }
    }

    fn entry(&self, id: &ImageId) -> Option<&Entry> {
        self.images.iter().find(|e| e.header.id() == *id)
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(TEMP_FILENAME)
    }

    fn offset_path(&self) -> PathBuf {
        self.dir.join(OFFSET_FILENAME)
    }

    fn saved_offset(&self) -> u32 {
        match std::fs::read(self.offset_path()) {
            Ok(b) => b
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn remove_offset(&self) -> Result<()> {
        match std::fs::remove_file(self.offset_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(_) => Err(OtaError::Storage("can't remove download offset")),
        }
    }

    fn open_temp(&self) -> Option<File> {
        File::open(self.temp_path()).ok()
    }
}

impl ImageStore for FsStore {
    fn max_concurrent_images(&self) -> usize {
        usize::MAX
    }

    fn count(&mut self) -> usize {
        self.images.len()
    }

    fn first(&mut self) -> Option<ImageId> {
        self.images.first().map(|e| e.header.id())
    }

    fn next(&mut self, prev: &ImageId) -> Option<ImageId> {
        let i = self.images.iter().position(|e| e.header.id() == *prev)?;
        self.images.get(i + 1).map(|e| e.header.id())
    }

    fn header(&mut self, id: &ImageId) -> Result<OtaHeader> {
        self.entry(id)
            .map(|e| e.header.clone())
            .ok_or(OtaError::NotFound)
    }

    fn read(
        &mut self,
        id: &ImageId,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let e = self.entry(id).ok_or(OtaError::NotFound)?;
        let avail = e.header.image_size.saturating_sub(offset) as usize;
        let l = avail.min(buf.len());
        if l == 0 {
            return Ok(0);
        }
        let f = File::open(&e.path)
            .map_err(|_| OtaError::Storage("can't open image"))?;
        f.read_exact_at(&mut buf[..l], offset as u64)
            .map_err(|_| OtaError::Storage("image read failed"))?;
        Ok(l)
    }

    fn delete(&mut self, id: &ImageId) -> Result<Progress> {
        let i = self
            .images
            .iter()
            .position(|e| e.header.id() == *id)
            .ok_or(OtaError::NotFound)?;
        // The file is kept, it reappears on reload
        let e = self.images.remove(i);
        info!("forgetting image {id} ({})", e.path.display());
        Ok(Progress::Done)
    }

    fn clear_temp(&mut self) -> Result<Progress> {
        match std::fs::remove_file(self.temp_path()) {
            Ok(()) => debug!("removed partial download"),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(_) => return Err(OtaError::Storage("can't remove download")),
        }
        self.remove_offset()?;
        Ok(Progress::Done)
    }

    fn write_temp_unsaved(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.temp_path())
            .map_err(|_| OtaError::Storage("can't open download"))?;
        f.write_all_at(data, offset as u64)
            .map_err(|_| OtaError::Storage("download write failed"))
    }

    fn save_temp_offset(&mut self, offset: u32) -> Result<()> {
        if offset != 0 && offset <= self.saved_offset() {
            return Ok(());
        }
        trace!("recording download offset {offset}");
        std::fs::write(self.offset_path(), offset.to_le_bytes())
            .map_err(|_| OtaError::Storage("can't save download offset"))
    }

    fn check_temp(&mut self) -> DownloadState {
        let Some(mut f) = self.open_temp() else {
            return DownloadState::NONE;
        };
        let len = match f.metadata() {
            Ok(m) => m.len().min(u32::MAX as u64) as u32,
            Err(_) => return DownloadState::error(),
        };
        let len = len.min(self.saved_offset());
        if len <= OTA_HEADER_MIN_LEN as u32 {
            debug!("partial download too short to resume");
            return DownloadState::NONE;
        }
        match read_header(&mut f) {
            Ok(h) => {
                let status = if len >= h.image_size {
                    DownloadStatus::Complete
                } else {
                    DownloadStatus::PartialFound
                };
                DownloadState {
                    id: h.id(),
                    offset: len.min(h.image_size),
                    total: h.image_size,
                    status,
                }
            }
            Err(e) => {
                warn!("download has a bad header: {e}");
                DownloadState::error()
            }
        }
    }

    fn prepare_to_resume(&mut self) -> Result<Progress> {
        Ok(Progress::Done)
    }

    fn finish_download(&mut self, offset: u32) -> Result<()> {
        let mut f = self.open_temp().ok_or(OtaError::NotFound)?;
        let header = read_header(&mut f)?;
        if offset < header.image_size {
            return Err(OtaError::Storage("download incomplete"));
        }
        f.set_len(header.image_size as u64)
            .map_err(|_| OtaError::Storage("can't truncate download"))?;
        drop(f);

        let path = self.dir.join(image_filename(&header.id()));
        std::fs::rename(self.temp_path(), &path)
            .map_err(|_| OtaError::Storage("can't rename download"))?;
        self.remove_offset()?;
        info!("stored {} as {}", header.id(), path.display());
        self.insert(Entry { header, path });
        Ok(())
    }

    fn max_download_size(&self) -> u32 {
        self.max_download_size
    }
}
