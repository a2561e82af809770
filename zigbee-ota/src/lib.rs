// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Zigbee OTA Upgrade cluster base definitions.
 *
 * Copyright (c) 2024 Code Construct
 */

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Zigbee Over-the-Air Upgrade base support
//!
//! This crate implements the types shared by OTA clients, servers and
//! image tooling: device and image identifiers, ZCL status codes, the
//! common error type and the OTA cluster command payloads.

use core::fmt;

use nom::{
    combinator::map,
    number::complete::{le_u16, le_u32},
    sequence::tuple,
    IResult,
};
use num_derive::FromPrimitive;
use thiserror::Error;

pub mod proto;
mod util;
pub use util::*;

/// ZCL cluster id of the OTA Upgrade cluster
pub const OTA_CLUSTER_ID: u16 = 0x0019;

/// Zigbee PRO stack version, as carried in image headers
pub const ZIGBEE_PRO_STACK_VERSION: u16 = 0x0002;

/// Size of the ZCL frame header preceding every command payload
pub const ZCL_OVERHEAD: usize = 3;

/// Short network address of a node
pub type NodeId = u16;

pub(crate) type VResult<I, O> = IResult<I, O>;

/// Generic OTA error type
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// Message could not be sent
    #[error("Transport send failure")]
    Transport,
    /// Persistent storage failure
    #[error("Storage error: {0}")]
    Storage(&'static str),
    /// Malformed image container
    #[error("Image format error: {0}")]
    Format(&'static str),
    /// Short or malformed wire message
    #[error("OTA protocol error: {0}")]
    Protocol(&'static str),
    /// Peer declined or deferred the operation
    #[error("Rejected with status {0:?}")]
    Rejected(ZclStatus),
    /// Image failed signature or digest checks
    #[error("Image verification failed")]
    Verification,
    /// No free table entry
    #[error("Table full")]
    Full,
    /// Another operation of the same kind is already active
    #[error("Invalid call, operation already active")]
    InvalidCall,
    /// A storage operation is still in progress
    #[error("Busy")]
    Busy,
    /// Requested data is larger than the caller's limit
    #[error("Requested data too long")]
    DataTooLong,
    /// Image or tag does not exist
    #[error("Not found")]
    NotFound,
    /// Output buffer too small
    #[error("Insufficient buffer space")]
    NoSpace,
}

/// OTA return type
pub type Result<T> = core::result::Result<T, OtaError>;

/// Constructs an [`OtaError::Protocol`], tracing the failing input
#[macro_export]
macro_rules! proto_error {
    ($msg: expr) => {{
        log::trace!("OTA protocol error: {}", $msg);
        $crate::OtaError::Protocol($msg)
    }};
}

/// Constructs an [`OtaError::Format`], tracing the failure
#[macro_export]
macro_rules! format_error {
    ($msg: expr) => {{
        log::debug!("OTA image format error: {}", $msg);
        $crate::OtaError::Format($msg)
    }};
}

/// ZCL status codes used by the OTA Upgrade cluster
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ZclStatus {
    Success = 0x00,
    Failure = 0x01,
    NotAuthorized = 0x7E,
    MalformedCommand = 0x80,
    UnsupClusterCommand = 0x81,
    InvalidField = 0x85,
    InvalidValue = 0x87,
    InsufficientSpace = 0x89,
    NotFound = 0x8B,
    Abort = 0x95,
    InvalidImage = 0x96,
    WaitForData = 0x97,
    NoImageAvailable = 0x98,
    RequireMoreImage = 0x99,
}

impl From<ZclStatus> for u8 {
    fn from(s: ZclStatus) -> u8 {
        s as u8
    }
}

/// IEEE 802.15.4 extended address
///
/// Stored in over-the-air (little-endian) byte order.
/// Displayed most significant byte first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    /// All zeroes, never a valid device address
    pub const NULL: Self = Self([0; 8]);

    /// Returns whether this is the null EUI64
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Returns the address with byte order reversed
    ///
    /// Certificates carry EUI64s big-endian.
    pub fn reversed(&self) -> Self {
        let mut b = self.0;
        b.reverse();
        Self(b)
    }

    /// Constructs from a big-endian byte slice such as a certificate field
    pub fn from_be_slice(s: &[u8]) -> Option<Self> {
        let b: [u8; 8] = s.try_into().ok()?;
        Some(Self(b).reversed())
    }

    /// Parses an over-the-air EUI64
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(nom::bytes::complete::take(8usize), |b: &[u8]| {
            let mut e = [0u8; 8];
            e.copy_from_slice(b);
            Self(e)
        })(buf)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().rev() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Identifies a firmware image
///
/// The (manufacturer, type, version) triplet is carried by most OTA
/// commands. Images destined for a single device also carry its EUI64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId {
    /// Manufacturer code
    pub manufacturer_id: u16,
    /// Manufacturer specific image type
    pub image_type: u16,
    /// Firmware version
    pub firmware_version: u32,
    /// Destination device for device-specific images
    pub device_eui64: Option<Eui64>,
}

impl ImageId {
    /// Matches any manufacturer in a notify or upgrade end response
    pub const WILDCARD_MANUFACTURER: u16 = 0xFFFF;
    /// Matches any image type
    pub const WILDCARD_TYPE: u16 = 0xFFFF;
    /// Matches any version
    pub const WILDCARD_VERSION: u32 = 0xFFFF_FFFF;

    /// Sentinel for "no image"
    pub const INVALID: Self = Self {
        manufacturer_id: 0xFFFF,
        image_type: 0xFFFF,
        firmware_version: 0xFFFF_FFFF,
        device_eui64: None,
    };

    /// Length of the triplet on the wire
    pub const TRIPLET_LEN: usize = 8;

    /// Constructs an id without a device-specific destination
    pub const fn new(
        manufacturer_id: u16,
        image_type: u16,
        firmware_version: u32,
    ) -> Self {
        Self {
            manufacturer_id,
            image_type,
            firmware_version,
            device_eui64: None,
        }
    }

    /// Returns `false` for the [`ImageId::INVALID`] sentinel
    pub fn is_valid(&self) -> bool {
        !self.same_triplet(&Self::INVALID)
    }

    /// Compares manufacturer, type and version, ignoring the destination
    pub fn same_triplet(&self, other: &Self) -> bool {
        self.manufacturer_id == other.manufacturer_id
            && self.image_type == other.image_type
            && self.firmware_version == other.firmware_version
    }

    /// Compares manufacturer and type only
    pub fn same_image_type(&self, other: &Self) -> bool {
        self.manufacturer_id == other.manufacturer_id
            && self.image_type == other.image_type
    }

    /// Returns whether `pattern` matches this id, where `pattern`
    /// fields may be wildcards.
    pub fn matches(&self, pattern: &Self) -> bool {
        (pattern.manufacturer_id == Self::WILDCARD_MANUFACTURER
            || pattern.manufacturer_id == self.manufacturer_id)
            && (pattern.image_type == Self::WILDCARD_TYPE
                || pattern.image_type == self.image_type)
            && (pattern.firmware_version == Self::WILDCARD_VERSION
                || pattern.firmware_version == self.firmware_version)
    }

    /// Parses the 8 byte (manufacturer, type, version) triplet
    pub fn parse_triplet(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u16, le_u16, le_u32)), |(m, t, v)| Self::new(m, t, v))(
            buf,
        )
    }

    /// Writes the 8 byte triplet
    pub fn write_triplet(&self, w: &mut SliceWriter) -> Option<usize> {
        w.push_le16(self.manufacturer_id)?;
        w.push_le16(self.image_type)?;
        w.push_le32(self.firmware_version)?;
        Some(Self::TRIPLET_LEN)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mfg 0x{:04X} type 0x{:04X} version 0x{:08X}",
            self.manufacturer_id, self.image_type, self.firmware_version
        )?;
        if let Some(e) = &self.device_eui64 {
            write!(f, " dest {e}")?;
        }
        Ok(())
    }
}
