// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Zigbee OTA Upgrade cluster commands
 *
 * Copyright (c) 2024 Code Construct
 */

//! OTA Upgrade cluster command payloads
//!
//! Payloads exclude the ZCL frame header, which is handled by the transport.
//! Parsers tolerate trailing bytes, as later revisions of the cluster
//! append optional fields.

#[allow(unused)]
use log::{debug, trace};

use nom::{
    combinator::{cond, fail, map, map_opt},
    multi::length_data,
    number::complete::{le_u16, le_u32, le_u8},
    sequence::tuple,
    Finish,
};
use num_traits::FromPrimitive;

use crate::*;

/// Command id of the ZCL global Default Response
pub const DEFAULT_RESPONSE_CMD: u8 = 0x0B;

/// Upgrade time meaning "wait for a later upgrade command"
pub const UPGRADE_TIME_WAIT: u32 = 0xFFFF_FFFF;

/// OTA Upgrade cluster command ids
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Cmd {
    ImageNotify = 0x00,
    QueryNextImageRequest = 0x01,
    QueryNextImageResponse = 0x02,
    ImageBlockRequest = 0x03,
    ImagePageRequest = 0x04,
    ImageBlockResponse = 0x05,
    UpgradeEndRequest = 0x06,
    UpgradeEndResponse = 0x07,
    QuerySpecificFileRequest = 0x08,
    QuerySpecificFileResponse = 0x09,
}

fn parse_status(buf: &[u8]) -> VResult<&[u8], ZclStatus> {
    map_opt(le_u8, ZclStatus::from_u8)(buf)
}

/// Optional content of an Image Notify, selected by its payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPayload {
    /// Payload type 0, query jitter only
    JitterOnly,
    /// Payload type 1
    Manufacturer(u16),
    /// Payload type 2, manufacturer and image type
    ManufacturerType(u16, u16),
    /// Payload type 3, full triplet
    Full(ImageId),
}

impl NotifyPayload {
    /// Highest valid payload type
    pub const MAX_TYPE: u8 = 3;

    /// Payload type byte
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::JitterOnly => 0,
            Self::Manufacturer(_) => 1,
            Self::ManufacturerType(..) => 2,
            Self::Full(_) => 3,
        }
    }

    /// Returns the notified image, with unspecified fields as wildcards
    pub fn as_pattern(&self) -> ImageId {
        let mut id = ImageId::INVALID;
        match *self {
            Self::JitterOnly => (),
            Self::Manufacturer(m) => id.manufacturer_id = m,
            Self::ManufacturerType(m, t) => {
                id.manufacturer_id = m;
                id.image_type = t;
            }
            Self::Full(i) => id = i,
        }
        id
    }
}

/// Image Notify, server to client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageNotify {
    /// Query jitter, 1 to 100
    pub jitter: u8,
    /// Optional image details
    pub payload: NotifyPayload,
}

impl ImageNotify {
    /// Maximum query jitter value
    pub const MAX_JITTER: u8 = 100;

    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (ptype, jitter)) = tuple((le_u8, le_u8))(buf)?;
        let (r, payload) = match ptype {
            0 => (r, NotifyPayload::JitterOnly),
            1 => map(le_u16, NotifyPayload::Manufacturer)(r)?,
            2 => map(tuple((le_u16, le_u16)), |(m, t)| {
                NotifyPayload::ManufacturerType(m, t)
            })(r)?,
            3 => map(ImageId::parse_triplet, NotifyPayload::Full)(r)?,
            _ => return fail(r),
        };
        Ok((r, Self { jitter, payload }))
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push_le8(self.payload.payload_type())?;
        w.push_le8(self.jitter)?;
        match &self.payload {
            NotifyPayload::JitterOnly => (),
            NotifyPayload::Manufacturer(m) => {
                w.push_le16(*m)?;
            }
            NotifyPayload::ManufacturerType(m, t) => {
                w.push_le16(*m)?;
                w.push_le16(*t)?;
            }
            NotifyPayload::Full(id) => {
                id.write_triplet(w)?;
            }
        }
        Some(())
    }
}

/// Query Next Image Request, client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryNextImageRequest {
    /// Currently running image
    pub current: ImageId,
    /// Client hardware version, if reported
    pub hardware_version: Option<u16>,
}

impl QueryNextImageRequest {
    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (fc, current)) = tuple((le_u8, ImageId::parse_triplet))(buf)?;
        let (r, hardware_version) = cond(fc & 0x01 != 0, le_u16)(r)?;
        Ok((
            r,
            Self {
                current,
                hardware_version,
            },
        ))
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push_le8(self.hardware_version.is_some() as u8)?;
        self.current.write_triplet(w)?;
        if let Some(hw) = self.hardware_version {
            w.push_le16(hw)?;
        }
        Some(())
    }
}

/// An image offered by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOffer {
    /// Offered image
    pub id: ImageId,
    /// Total image size in bytes
    pub size: u32,
}

/// Query Next Image Response and Query Specific File Response
///
/// `offer` is present only for `Success` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResponse {
    /// Response status
    pub status: ZclStatus,
    /// Offered image on success
    pub offer: Option<ImageOffer>,
}

impl QueryResponse {
    /// Constructs a successful response
    pub fn offer(id: ImageId, size: u32) -> Self {
        Self {
            status: ZclStatus::Success,
            offer: Some(ImageOffer { id, size }),
        }
    }

    /// Constructs a response without an image
    pub fn status(status: ZclStatus) -> Self {
        Self {
            status,
            offer: None,
        }
    }

    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, status) = parse_status(buf)?;
        let (r, offer) = cond(
            status == ZclStatus::Success,
            map(tuple((ImageId::parse_triplet, le_u32)), |(id, size)| {
                ImageOffer { id, size }
            }),
        )(r)?;
        Ok((r, Self { status, offer }))
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push_le8(self.status.into())?;
        if self.status == ZclStatus::Success {
            let o = self.offer.as_ref()?;
            o.id.write_triplet(w)?;
            w.push_le32(o.size)?;
        }
        Some(())
    }
}

/// Image Block Request, client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBlockRequest {
    /// Image being downloaded
    pub id: ImageId,
    /// Requested file offset
    pub offset: u32,
    /// Largest block the client accepts
    pub max_data_size: u8,
    /// Requesting node's address, field control bit 0
    pub request_node: Option<Eui64>,
    /// Client's current minimum block period in milliseconds,
    /// field control bit 1. Presence indicates client support.
    pub min_block_period: Option<u16>,
}

impl ImageBlockRequest {
    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (fc, id, offset, max_data_size)) =
            tuple((le_u8, ImageId::parse_triplet, le_u32, le_u8))(buf)?;
        let (r, request_node) = cond(fc & 0x01 != 0, Eui64::parse)(r)?;
        let (r, min_block_period) = cond(fc & 0x02 != 0, le_u16)(r)?;
        Ok((
            r,
            Self {
                id,
                offset,
                max_data_size,
                request_node,
                min_block_period,
            },
        ))
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        let fc = self.request_node.is_some() as u8
            | (self.min_block_period.is_some() as u8) << 1;
        w.push_le8(fc)?;
        self.id.write_triplet(w)?;
        w.push_le32(self.offset)?;
        w.push_le8(self.max_data_size)?;
        if let Some(e) = &self.request_node {
            w.push(&e.0)?;
        }
        if let Some(p) = self.min_block_period {
            w.push_le16(p)?;
        }
        Some(())
    }
}

/// Image Page Request, client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePageRequest {
    /// Image being downloaded
    pub id: ImageId,
    /// File offset of the page start
    pub offset: u32,
    /// Largest block the client accepts
    pub max_data_size: u8,
    /// Bytes to send in total for this page
    pub page_size: u16,
    /// Milliseconds between successive block responses
    pub response_spacing: u16,
    /// Requesting node's address, field control bit 0
    pub request_node: Option<Eui64>,
}

impl ImagePageRequest {
    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (fc, id, offset, max_data_size, page_size, response_spacing)) =
            tuple((
                le_u8,
                ImageId::parse_triplet,
                le_u32,
                le_u8,
                le_u16,
                le_u16,
            ))(buf)?;
        let (r, request_node) = cond(fc & 0x01 != 0, Eui64::parse)(r)?;
        Ok((
            r,
            Self {
                id,
                offset,
                max_data_size,
                page_size,
                response_spacing,
                request_node,
            },
        ))
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push_le8(self.request_node.is_some() as u8)?;
        self.id.write_triplet(w)?;
        w.push_le32(self.offset)?;
        w.push_le8(self.max_data_size)?;
        w.push_le16(self.page_size)?;
        w.push_le16(self.response_spacing)?;
        if let Some(e) = &self.request_node {
            w.push(&e.0)?;
        }
        Some(())
    }
}

/// Image Block Response, server to client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBlockResponse<'a> {
    /// Block of image data
    Success {
        /// Image being downloaded
        id: ImageId,
        /// File offset of `data`
        offset: u32,
        /// Image data, at most 255 bytes
        data: &'a [u8],
    },
    /// Server asks the client to retry later
    WaitForData {
        /// Server's current UTC time, seconds
        current_time: u32,
        /// Time the client should retry, seconds
        request_time: u32,
        /// Minimum block period the client should now use, milliseconds
        min_block_period: Option<u16>,
    },
    /// Any other status, such as `Abort` or `NoImageAvailable`
    Status(ZclStatus),
}

impl<'a> ImageBlockResponse<'a> {
    /// Fixed bytes of a success response preceding the data, excluding
    /// the ZCL header
    pub const SUCCESS_OVERHEAD: usize = 1 + ImageId::TRIPLET_LEN + 4 + 1;

    /// Response status
    pub fn status(&self) -> ZclStatus {
        match self {
            Self::Success { .. } => ZclStatus::Success,
            Self::WaitForData { .. } => ZclStatus::WaitForData,
            Self::Status(s) => *s,
        }
    }

    fn parse(buf: &'a [u8]) -> VResult<&'a [u8], Self> {
        let (r, status) = parse_status(buf)?;
        match status {
            ZclStatus::Success => {
                let (r, (id, offset, data)) =
                    tuple((ImageId::parse_triplet, le_u32, length_data(le_u8)))(
                        r,
                    )?;
                Ok((r, Self::Success { id, offset, data }))
            }
            ZclStatus::WaitForData => {
                let (r, (current_time, request_time)) =
                    tuple((le_u32, le_u32))(r)?;
                let (r, min_block_period) = cond(r.len() >= 2, le_u16)(r)?;
                Ok((
                    r,
                    Self::WaitForData {
                        current_time,
                        request_time,
                        min_block_period,
                    },
                ))
            }
            s => Ok((r, Self::Status(s))),
        }
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push_le8(self.status().into())?;
        match self {
            Self::Success { id, offset, data } => {
                let len = u8::try_from(data.len()).ok()?;
                id.write_triplet(w)?;
                w.push_le32(*offset)?;
                w.push_le8(len)?;
                w.push(data)?;
            }
            Self::WaitForData {
                current_time,
                request_time,
                min_block_period,
            } => {
                w.push_le32(*current_time)?;
                w.push_le32(*request_time)?;
                if let Some(p) = min_block_period {
                    w.push_le16(*p)?;
                }
            }
            Self::Status(_) => (),
        }
        Some(())
    }
}

/// Upgrade End Request, client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndRequest {
    /// `Success`, `Abort`, `InvalidImage` or `RequireMoreImage`
    pub status: ZclStatus,
    /// Downloaded image
    pub id: ImageId,
}

impl UpgradeEndRequest {
    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((parse_status, ImageId::parse_triplet)), |(status, id)| {
            Self { status, id }
        })(buf)
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push_le8(self.status.into())?;
        self.id.write_triplet(w)?;
        Some(())
    }
}

/// Upgrade End Response, server to client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndResponse {
    /// Image to apply. Fields may be wildcards.
    pub id: ImageId,
    /// Server's current UTC time, seconds
    pub current_time: u32,
    /// Time to apply the upgrade, seconds. [`UPGRADE_TIME_WAIT`] defers.
    pub upgrade_time: u32,
}

impl UpgradeEndResponse {
    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(
            tuple((ImageId::parse_triplet, le_u32, le_u32)),
            |(id, current_time, upgrade_time)| Self {
                id,
                current_time,
                upgrade_time,
            },
        )(buf)
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        self.id.write_triplet(w)?;
        w.push_le32(self.current_time)?;
        w.push_le32(self.upgrade_time)?;
        Some(())
    }
}

/// Query Specific File Request, client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySpecificFileRequest {
    /// Requesting node's address
    pub request_node: Eui64,
    /// Requested file
    pub id: ImageId,
    /// Client's Zigbee stack version
    pub stack_version: u16,
}

impl QuerySpecificFileRequest {
    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(
            tuple((Eui64::parse, ImageId::parse_triplet, le_u16)),
            |(request_node, id, stack_version)| Self {
                request_node,
                id,
                stack_version,
            },
        )(buf)
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push(&self.request_node.0)?;
        self.id.write_triplet(w)?;
        w.push_le16(self.stack_version)?;
        Some(())
    }
}

/// ZCL Default Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultResponse {
    /// Command id being responded to
    pub command: u8,
    /// Result status
    pub status: ZclStatus,
}

impl DefaultResponse {
    fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u8, parse_status)), |(command, status)| Self {
            command,
            status,
        })(buf)
    }

    fn write_buf(&self, w: &mut SliceWriter) -> Option<()> {
        w.push_le8(self.command)?;
        w.push_le8(self.status.into())?;
        Some(())
    }
}

/// An OTA cluster message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message<'a> {
    ImageNotify(ImageNotify),
    QueryNextImageRequest(QueryNextImageRequest),
    QueryNextImageResponse(QueryResponse),
    ImageBlockRequest(ImageBlockRequest),
    ImagePageRequest(ImagePageRequest),
    ImageBlockResponse(ImageBlockResponse<'a>),
    UpgradeEndRequest(UpgradeEndRequest),
    UpgradeEndResponse(UpgradeEndResponse),
    QuerySpecificFileRequest(QuerySpecificFileRequest),
    QuerySpecificFileResponse(QueryResponse),
    /// Global command, not cluster specific
    DefaultResponse(DefaultResponse),
}

impl<'a> Message<'a> {
    /// Parses a command payload
    ///
    /// `cluster_specific` is the ZCL frame type; `false` selects global
    /// commands, of which only Default Response is handled.
    pub fn parse(
        cluster_specific: bool,
        cmd_id: u8,
        buf: &'a [u8],
    ) -> Result<Self> {
        if !cluster_specific {
            if cmd_id != DEFAULT_RESPONSE_CMD {
                return Err(proto_error!("Unhandled global command"));
            }
            return Self::finish(DefaultResponse::parse(buf))
                .map(Self::DefaultResponse);
        }

        let Some(cmd) = Cmd::from_u8(cmd_id) else {
            return Err(proto_error!("Unknown OTA command"));
        };

        trace!("parse {cmd:?} len {}", buf.len());
        match cmd {
            Cmd::ImageNotify => {
                Self::finish(ImageNotify::parse(buf)).map(Self::ImageNotify)
            }
            Cmd::QueryNextImageRequest => {
                Self::finish(QueryNextImageRequest::parse(buf))
                    .map(Self::QueryNextImageRequest)
            }
            Cmd::QueryNextImageResponse => {
                Self::finish(QueryResponse::parse(buf))
                    .map(Self::QueryNextImageResponse)
            }
            Cmd::ImageBlockRequest => {
                Self::finish(ImageBlockRequest::parse(buf))
                    .map(Self::ImageBlockRequest)
            }
            Cmd::ImagePageRequest => Self::finish(ImagePageRequest::parse(buf))
                .map(Self::ImagePageRequest),
            Cmd::ImageBlockResponse => {
                Self::finish(ImageBlockResponse::parse(buf))
                    .map(Self::ImageBlockResponse)
            }
            Cmd::UpgradeEndRequest => {
                Self::finish(UpgradeEndRequest::parse(buf))
                    .map(Self::UpgradeEndRequest)
            }
            Cmd::UpgradeEndResponse => {
                Self::finish(UpgradeEndResponse::parse(buf))
                    .map(Self::UpgradeEndResponse)
            }
            Cmd::QuerySpecificFileRequest => {
                Self::finish(QuerySpecificFileRequest::parse(buf))
                    .map(Self::QuerySpecificFileRequest)
            }
            Cmd::QuerySpecificFileResponse => {
                Self::finish(QueryResponse::parse(buf))
                    .map(Self::QuerySpecificFileResponse)
            }
        }
    }

    fn finish<T>(r: VResult<&[u8], T>) -> Result<T> {
        r.finish()
            .map(|(_rest, t)| t)
            .map_err(|_| proto_error!("Malformed OTA command"))
    }

    /// Returns the ZCL command id
    pub fn cmd_id(&self) -> u8 {
        let c = match self {
            Self::ImageNotify(_) => Cmd::ImageNotify,
            Self::QueryNextImageRequest(_) => Cmd::QueryNextImageRequest,
            Self::QueryNextImageResponse(_) => Cmd::QueryNextImageResponse,
            Self::ImageBlockRequest(_) => Cmd::ImageBlockRequest,
            Self::ImagePageRequest(_) => Cmd::ImagePageRequest,
            Self::ImageBlockResponse(_) => Cmd::ImageBlockResponse,
            Self::UpgradeEndRequest(_) => Cmd::UpgradeEndRequest,
            Self::UpgradeEndResponse(_) => Cmd::UpgradeEndResponse,
            Self::QuerySpecificFileRequest(_) => Cmd::QuerySpecificFileRequest,
            Self::QuerySpecificFileResponse(_) => {
                Cmd::QuerySpecificFileResponse
            }
            Self::DefaultResponse(_) => return DEFAULT_RESPONSE_CMD,
        };
        c as u8
    }

    /// Whether the ZCL frame type is cluster specific
    pub fn cluster_specific(&self) -> bool {
        !matches!(self, Self::DefaultResponse(_))
    }

    /// Writes the command payload, returning its length
    pub fn write_buf(&self, b: &mut [u8]) -> Option<usize> {
        let mut w = SliceWriter::new(b);
        match self {
            Self::ImageNotify(m) => m.write_buf(&mut w),
            Self::QueryNextImageRequest(m) => m.write_buf(&mut w),
            Self::QueryNextImageResponse(m) => m.write_buf(&mut w),
            Self::ImageBlockRequest(m) => m.write_buf(&mut w),
            Self::ImagePageRequest(m) => m.write_buf(&mut w),
            Self::ImageBlockResponse(m) => m.write_buf(&mut w),
            Self::UpgradeEndRequest(m) => m.write_buf(&mut w),
            Self::UpgradeEndResponse(m) => m.write_buf(&mut w),
            Self::QuerySpecificFileRequest(m) => m.write_buf(&mut w),
            Self::QuerySpecificFileResponse(m) => m.write_buf(&mut w),
            Self::DefaultResponse(m) => m.write_buf(&mut w),
        }?;
        Some(w.written())
    }
}

/// Returns the minimum ZCL payload length of a cluster command
pub fn min_payload_len(cmd: Cmd) -> usize {
    match cmd {
        Cmd::ImageNotify => 2,
        Cmd::QueryNextImageRequest => 9,
        Cmd::QueryNextImageResponse => 1,
        Cmd::ImageBlockRequest => 14,
        Cmd::ImagePageRequest => 18,
        Cmd::ImageBlockResponse => 1,
        Cmd::UpgradeEndRequest => 1,
        Cmd::UpgradeEndResponse => 16,
        Cmd::QuerySpecificFileRequest => 18,
        Cmd::QuerySpecificFileResponse => 1,
    }
}
