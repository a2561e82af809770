// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Zigbee OTA upgrade: image container format
 *
 * Copyright (c) 2024 Code Construct
 */
#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![forbid(unsafe_code)]

//! Zigbee OTA firmware update
//!
//! The crate root handles the OTA image container: a fixed header
//! followed by a sequence of tagged sub-elements. Transfer state
//! machines and storage live in submodules.
//!
//! Apart from [`fsstore`] this is suitable for microcontroller targets
//! and supports `no_std`.

use core::fmt;
#[allow(unused)]
use log::{debug, trace};

#[cfg(feature = "alloc")]
extern crate alloc;

use enumset::{EnumSet, EnumSetType};
use nom::{
    bytes::complete::take,
    combinator::cond,
    number::complete::{le_u16, le_u32, le_u8},
    sequence::tuple,
    Finish, IResult,
};

use zigbee_ota::{
    format_error, Eui64, ImageId, NoneNoSpace, OtaError, Result, SliceWriter,
};

/// Standalone bootloader server
pub mod bootload;
/// OTA client transfer engine
pub mod client;
/// Filesystem image store
#[cfg(feature = "std")]
pub mod fsstore;
/// Page request block accounting
pub mod page;
/// OTA server policy engine
pub mod server;
/// Image persistence
pub mod store;
/// Image signature verification
pub mod verify;
/// XMODEM style block transfer
pub mod xmodem;

/// OTA file magic number
pub const OTA_FILE_MAGIC: u32 = 0x0BEE_F11E;
/// Supported header version
pub const OTA_HEADER_VERSION: u16 = 0x0100;
/// Header length without optional fields
pub const OTA_HEADER_MIN_LEN: u16 = 56;
/// Header length with all optional fields
pub const OTA_HEADER_MAX_LEN: u16 = 69;
/// Header string field length
pub const HEADER_STRING_LEN: usize = 32;
/// Tag id and length preceding each tag's data
pub const TAG_OVERHEAD: u32 = 6;
/// Maximum number of tags in an image
pub const MAX_TAGS: usize = 6;

/// Upgrade image tag, the payload for the bootloader
pub const TAG_UPGRADE_IMAGE: u16 = 0x0000;
/// ECDSA signature tag: signer EUI64 then signature
pub const TAG_ECDSA_SIGNATURE: u16 = 0x0001;
/// ECDSA signing certificate tag
pub const TAG_ECDSA_SIGNING_CERT: u16 = 0x0002;

type VResult<I, O> = IResult<I, O>;

/// Optional header fields, the header's field control bits
#[derive(EnumSetType, Debug)]
#[enumset(repr = "u16")]
pub enum HeaderField {
    /// Security credential version, 1 byte
    SecurityCredentials = 0,
    /// Upgrade file destination, EUI64
    UpgradeDestination = 1,
    /// Minimum and maximum hardware versions
    HardwareVersions = 2,
}

/// An OTA image header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaHeader {
    /// Header version, [`OTA_HEADER_VERSION`]
    pub header_version: u16,
    /// Total header length. Tags start at this offset.
    pub header_length: u16,
    /// Manufacturer code
    pub manufacturer_id: u16,
    /// Image type
    pub image_type: u16,
    /// Firmware version
    pub firmware_version: u32,
    /// Zigbee stack version
    pub stack_version: u16,
    /// Free text, not terminated
    pub header_string: [u8; HEADER_STRING_LEN],
    /// Total image size including this header
    pub image_size: u32,
    /// Security credential version
    pub security_credentials: Option<u8>,
    /// Device this image is destined for
    pub upgrade_destination: Option<Eui64>,
    /// Minimum and maximum hardware versions, inclusive
    pub hardware_versions: Option<(u16, u16)>,
}

impl OtaHeader {
    /// Creates a header for `id` with no tags
    ///
    /// `image_size` is set to the header length. The id's
    /// device EUI64 becomes the upgrade destination.
    pub fn new(id: &ImageId, header_string: &str) -> Self {
        let mut s = [0u8; HEADER_STRING_LEN];
        let l = header_string.len().min(HEADER_STRING_LEN);
        s[..l].copy_from_slice(&header_string.as_bytes()[..l]);
        let mut h = Self {
            header_version: OTA_HEADER_VERSION,
            header_length: 0,
            manufacturer_id: id.manufacturer_id,
            image_type: id.image_type,
            firmware_version: id.firmware_version,
            stack_version: zigbee_ota::ZIGBEE_PRO_STACK_VERSION,
            header_string: s,
            image_size: 0,
            security_credentials: None,
            upgrade_destination: id.device_eui64,
            hardware_versions: None,
        };
        h.header_length = h.fields_length();
        h.image_size = h.header_length as u32;
        h
    }

    /// The optional fields present
    pub fn field_control(&self) -> EnumSet<HeaderField> {
        let mut f = EnumSet::empty();
        if self.security_credentials.is_some() {
            f |= HeaderField::SecurityCredentials;
        }
        if self.upgrade_destination.is_some() {
            f |= HeaderField::UpgradeDestination;
        }
        if self.hardware_versions.is_some() {
            f |= HeaderField::HardwareVersions;
        }
        f
    }

    /// Length of the fixed and present optional fields
    pub fn fields_length(&self) -> u16 {
        let mut l = OTA_HEADER_MIN_LEN;
        for f in self.field_control() {
            l += match f {
                HeaderField::SecurityCredentials => 1,
                HeaderField::UpgradeDestination => 8,
                HeaderField::HardwareVersions => 4,
            }
        }
        l
    }

    /// Sets optional fields, recomputing lengths
    ///
    /// `image_size` keeps the same tag length following the header.
    pub fn set_optional(
        &mut self,
        security_credentials: Option<u8>,
        upgrade_destination: Option<Eui64>,
        hardware_versions: Option<(u16, u16)>,
    ) {
        let tags_len = self.image_size.saturating_sub(self.header_length as u32);
        self.security_credentials = security_credentials;
        self.upgrade_destination = upgrade_destination;
        self.hardware_versions = hardware_versions;
        self.header_length = self.fields_length();
        self.image_size = self.header_length as u32 + tags_len;
    }

    /// Returns the image id described by this header
    pub fn id(&self) -> ImageId {
        ImageId {
            manufacturer_id: self.manufacturer_id,
            image_type: self.image_type,
            firmware_version: self.firmware_version,
            device_eui64: self.upgrade_destination,
        }
    }

    /// Returns whether `hw` falls in the image's hardware range
    ///
    /// Images without a range, or queries without a version, always match.
    pub fn hardware_ok(&self, hw: Option<u16>) -> bool {
        match (self.hardware_versions, hw) {
            (Some((min, max)), Some(hw)) => (min..=max).contains(&hw),
            _ => true,
        }
    }

    /// Header string up to any NUL padding
    pub fn header_str(&self) -> &str {
        let end = self
            .header_string
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(HEADER_STRING_LEN);
        core::str::from_utf8(&self.header_string[..end]).unwrap_or("")
    }

    fn parse_fields(buf: &[u8]) -> VResult<&[u8], Self> {
        let (
            r,
            (
                _magic,
                header_version,
                header_length,
                fc,
                manufacturer_id,
                image_type,
                firmware_version,
                stack_version,
                s,
                image_size,
            ),
        ) = tuple((
            le_u32,
            le_u16,
            le_u16,
            le_u16,
            le_u16,
            le_u16,
            le_u32,
            le_u16,
            take(HEADER_STRING_LEN),
            le_u32,
        ))(buf)?;

        let fc = EnumSet::<HeaderField>::from_u16_truncated(fc);
        let (r, security_credentials) =
            cond(fc.contains(HeaderField::SecurityCredentials), le_u8)(r)?;
        let (r, upgrade_destination) =
            cond(fc.contains(HeaderField::UpgradeDestination), Eui64::parse)(
                r,
            )?;
        let (r, hardware_versions) = cond(
            fc.contains(HeaderField::HardwareVersions),
            tuple((le_u16, le_u16)),
        )(r)?;

        let mut header_string = [0u8; HEADER_STRING_LEN];
        header_string.copy_from_slice(s);

        Ok((
            r,
            Self {
                header_version,
                header_length,
                manufacturer_id,
                image_type,
                firmware_version,
                stack_version,
                header_string,
                image_size,
                security_credentials,
                upgrade_destination,
                hardware_versions,
            },
        ))
    }

    /// Parses and validates a header
    ///
    /// `buf` must hold at least the fixed and optional fields. Bytes
    /// between those and `header_length` are not required.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let magic = buf
            .get(..4)
            .map(|m| u32::from_le_bytes([m[0], m[1], m[2], m[3]]));
        if magic != Some(OTA_FILE_MAGIC) {
            return Err(format_error!("Bad magic number"));
        }

        let (_, h) = Self::parse_fields(buf)
            .finish()
            .map_err(|_| format_error!("Header truncated"))?;

        if h.header_version != OTA_HEADER_VERSION {
            return Err(format_error!("Unsupported header version"));
        }
        if h.header_length < h.fields_length()
            || h.header_length > OTA_HEADER_MAX_LEN
        {
            return Err(format_error!("Bad header length"));
        }
        if h.image_size < h.header_length as u32 {
            return Err(format_error!("Image size less than header"));
        }
        Ok(h)
    }

    /// Serializes the header, writing `header_length` bytes
    pub fn write_buf(&self, b: &mut [u8]) -> Option<usize> {
        let fields = self.fields_length() as usize;
        let len = self.header_length as usize;
        if len < fields {
            return None;
        }
        let mut w = SliceWriter::new(b);
        w.push_le32(OTA_FILE_MAGIC)?;
        w.push_le16(self.header_version)?;
        w.push_le16(self.header_length)?;
        w.push_le16(self.field_control().as_u16())?;
        w.push_le16(self.manufacturer_id)?;
        w.push_le16(self.image_type)?;
        w.push_le32(self.firmware_version)?;
        w.push_le16(self.stack_version)?;
        w.push(&self.header_string)?;
        w.push_le32(self.image_size)?;
        if let Some(s) = self.security_credentials {
            w.push_le8(s)?;
        }
        if let Some(e) = &self.upgrade_destination {
            w.push(&e.0)?;
        }
        if let Some((min, max)) = self.hardware_versions {
            w.push_le16(min)?;
            w.push_le16(max)?;
        }
        debug_assert_eq!(w.written(), fields);
        w.fill(0, len - fields)?;
        Some(w.written())
    }
}

impl fmt::Display for OtaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\"", self.id(), self.header_str().escape_default())
    }
}

/// A tagged sub-element following the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Tag id
    pub id: u16,
    /// Length of the tag data, excluding [`TAG_OVERHEAD`]
    pub length: u32,
}

/// Tags of an image, in file order
pub type Tags = heapless::Vec<Tag, MAX_TAGS>;

/// Random access reads of a stored OTA file
pub trait ImageRead {
    /// Reads into `buf` from `offset`, returning the length read.
    ///
    /// Returns a short length only at the end of the file.
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize>;

    /// Reads exactly `buf.len()` bytes
    fn read_exact_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if self.read_at(offset, buf)? != buf.len() {
            return Err(format_error!("Image truncated"));
        }
        Ok(())
    }
}

impl ImageRead for &[u8] {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let s = self.get(offset as usize..).unwrap_or(&[]);
        let l = s.len().min(buf.len());
        buf[..l].copy_from_slice(&s[..l]);
        Ok(l)
    }
}

#[cfg(feature = "std")]
impl ImageRead for std::fs::File {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        self.seek(SeekFrom::Start(offset as u64))
            .map_err(|_| OtaError::Storage("seek failed"))?;
        let mut total = 0;
        while total < buf.len() {
            match self.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(l) => total += l,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
                Err(_) => return Err(OtaError::Storage("read failed")),
            }
        }
        Ok(total)
    }
}

/// Reads and validates the header at the start of an image
pub fn read_header(r: &mut impl ImageRead) -> Result<OtaHeader> {
    let mut b = [0u8; OTA_HEADER_MAX_LEN as usize];
    let l = r.read_at(0, &mut b)?;
    OtaHeader::parse(&b[..l])
}

/// Walks the tags following the header
///
/// Fails with [`OtaError::Format`] if the tags do not exactly fill
/// `image_size` or exceed [`MAX_TAGS`].
pub fn enumerate_tags(
    r: &mut impl ImageRead,
    header: &OtaHeader,
) -> Result<Tags> {
    let mut tags = Tags::new();
    let size = header.image_size;
    let mut offset = header.header_length as u32;

    while offset < size {
        if offset.saturating_add(TAG_OVERHEAD) > size {
            return Err(format_error!("Truncated tag header"));
        }
        let mut b = [0u8; TAG_OVERHEAD as usize];
        r.read_exact_at(offset, &mut b)?;
        let id = u16::from_le_bytes([b[0], b[1]]);
        let length = u32::from_le_bytes([b[2], b[3], b[4], b[5]]);

        offset = offset
            .checked_add(TAG_OVERHEAD)
            .and_then(|o| o.checked_add(length))
            .ok_or_else(|| format_error!("Tag length overflow"))?;
        if offset > size {
            return Err(format_error!("Tag overruns image size"));
        }

        trace!("tag 0x{id:04x} length {length}");
        tags.push(Tag { id, length })
            .map_err(|_| format_error!("Too many tags"))?;
    }
    Ok(tags)
}

/// Returns the file offset of a tag's data, and its length
pub fn tag_offset_and_size(
    r: &mut impl ImageRead,
    header: &OtaHeader,
    tag_id: u16,
) -> Result<(u32, u32)> {
    let mut offset = header.header_length as u32;
    for t in enumerate_tags(r, header)? {
        if t.id == tag_id {
            return Ok((offset + TAG_OVERHEAD, t.length));
        }
        // enumerate_tags has checked these don't overflow
        offset += TAG_OVERHEAD + t.length;
    }
    Err(OtaError::NotFound)
}

/// Reads a tag's data into `buf`, returning its length
///
/// Returns [`OtaError::DataTooLong`] if the tag is longer than `buf`.
pub fn tag_data(
    r: &mut impl ImageRead,
    header: &OtaHeader,
    tag_id: u16,
    buf: &mut [u8],
) -> Result<usize> {
    let (offset, len) = tag_offset_and_size(r, header, tag_id)?;
    let len = len as usize;
    let out = buf.get_mut(..len).ok_or(OtaError::DataTooLong)?;
    r.read_exact_at(offset, out)?;
    Ok(len)
}

/// Assembles an image from a header and tags
///
/// The header's `image_size` is updated to match.
#[cfg(feature = "alloc")]
pub fn build_image(
    header: &mut OtaHeader,
    tags: &[(u16, &[u8])],
) -> Result<alloc::vec::Vec<u8>> {
    if tags.len() > MAX_TAGS {
        return Err(format_error!("Too many tags"));
    }
    let tags_len: usize = tags
        .iter()
        .map(|(_, d)| TAG_OVERHEAD as usize + d.len())
        .sum();
    let total = header.header_length as usize + tags_len;
    header.image_size =
        u32::try_from(total).map_err(|_| format_error!("Image too large"))?;

    let mut v = alloc::vec![0u8; total];
    let l = header.write_buf(&mut v).space()?;
    let mut w = SliceWriter::new(&mut v[l..]);
    for (id, data) in tags {
        let dl = u32::try_from(data.len())
            .map_err(|_| format_error!("Tag too large"))?;
        w.push_le16(*id).space()?;
        w.push_le32(dl).space()?;
        w.push(data).space()?;
    }
    Ok(v)
}
