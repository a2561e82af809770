// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * OTA Upgrade server policy engine.
 *
 * Copyright (c) 2024 Code Construct
 */

//! OTA server
//!
//! [`Server`] answers client queries and block requests from an
//! [`ImageStore`], paces page request responses from
//! [`Server::progress`] and decides when clients may apply an image.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::store::ImageStore;
use zigbee_ota::proto::{
    Cmd, DefaultResponse, ImageBlockRequest, ImageBlockResponse, ImageNotify,
    ImagePageRequest, Message, NotifyPayload, QueryNextImageRequest,
    QueryResponse, UpgradeEndRequest, UpgradeEndResponse, UPGRADE_TIME_WAIT,
};
use zigbee_ota::{ImageId, NodeId, OtaError, Result, ZclStatus, ZCL_OVERHEAD};

/// Shortest spacing between page request blocks
pub const MIN_RESPONSE_SPACING_MS: u16 = 10;
/// Upgrade delay for [`UpgradePolicy::Soon`], seconds
pub const UPGRADE_SOON_DELAY_S: u32 = 120;
/// Delay requested by [`BlockFault::DelayOnce`], seconds
pub const BLOCK_FAULT_DELAY_S: u32 = 120;

/// Which offered versions are acceptable, relative to the running one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPolicy {
    UpgradeIfNewer,
    DowngradeIfOlder,
    ReinstallIfSame,
    /// Never offer an image
    NoUpgrade,
}

/// What a client is told once it has downloaded an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePolicy {
    /// Apply immediately
    Now,
    /// Apply after [`UPGRADE_SOON_DELAY_S`]
    Soon,
    /// Wait for a later upgrade command
    AskLater,
    /// Discard the image
    Abort,
}

/// Block request fault injection, for conformance testing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFault {
    /// Normal operation
    SendBlock,
    /// Answer the next request with WaitForData, then revert
    DelayOnce,
    /// Abort any request past the start of the image
    Abort,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub query_policy: QueryPolicy,
    pub upgrade_policy: UpgradePolicy,
    /// Minimum block request period, milliseconds. 0 disables.
    pub min_block_period_ms: u16,
    /// Largest block sent, before the transport limit
    pub max_block_size: u8,
    pub page_request_supported: bool,
    pub block_fault: BlockFault,
    /// Drop every nth page block, to exercise client retries
    pub page_miss_modulus: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            query_policy: QueryPolicy::UpgradeIfNewer,
            upgrade_policy: UpgradePolicy::Now,
            min_block_period_ms: 0,
            max_block_size: 63,
            page_request_supported: true,
            block_fault: BlockFault::SendBlock,
            page_miss_modulus: None,
        }
    }
}

/// Message transport for a [`Server`]
pub trait Transport {
    /// Monotonic time in milliseconds
    fn now(&mut self) -> u64;

    /// UTC time in seconds, used in upgrade and wait times
    fn utc_time(&mut self) -> u32 {
        (self.now() / 1000) as u32
    }

    /// Sends an OTA cluster message
    fn send(&mut self, dest: NodeId, msg: &Message) -> Result<()>;

    /// Largest application payload to `dest`, including the ZCL header
    fn max_payload(&mut self, dest: NodeId) -> usize;
}

/// An active page request
#[derive(Debug)]
struct PageSession {
    dest: NodeId,
    id: ImageId,
    offset: u32,
    end: u32,
    block_size: u8,
    spacing_ms: u64,
    next_send: u64,
    sent: u32,
}

/// OTA server policy engine
pub struct Server {
    config: ServerConfig,
    page: Option<PageSession>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, page: None }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Changes policy at runtime
    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Whether a page request is being served
    pub fn page_active(&self) -> bool {
        self.page.is_some()
    }

    /// Handles an incoming OTA cluster frame
    ///
    /// Malformed frames are dropped, returning an error.
    pub fn receive(
        &mut self,
        src: NodeId,
        cluster_specific: bool,
        cmd: u8,
        payload: &[u8],
        store: &mut impl ImageStore,
        t: &mut impl Transport,
    ) -> Result<()> {
        let msg = Message::parse(cluster_specific, cmd, payload).map_err(|e| {
            debug!("dropping message 0x{cmd:02x} from 0x{src:04x}: {e}");
            e
        })?;
        self.handle(src, &msg, store, t)
    }

    /// Handles a parsed message, returning any send failure
    pub fn handle(
        &mut self,
        src: NodeId,
        msg: &Message,
        store: &mut impl ImageStore,
        t: &mut impl Transport,
    ) -> Result<()> {
        trace!("server rx {msg:?} from 0x{src:04x}");
        match msg {
            Message::QueryNextImageRequest(q) => {
                let r = self.query_next_image(store, q);
                t.send(src, &Message::QueryNextImageResponse(r))
            }
            Message::ImageBlockRequest(b) => self.image_block(src, b, store, t),
            Message::ImagePageRequest(p) => self.image_page(src, p, store, t),
            Message::UpgradeEndRequest(u) => self.upgrade_end(src, u, t),
            Message::QuerySpecificFileRequest(_) => {
                debug!("query specific file is not supported");
                let status = ZclStatus::UnsupClusterCommand;
                reject(t, src, Cmd::QuerySpecificFileRequest, status)
            }
            Message::DefaultResponse(_) => Ok(()),
            m => {
                debug!("unexpected server message 0x{:02x}", m.cmd_id());
                Ok(())
            }
        }
    }

    /// Decides which image, if any, to offer a client
    pub fn query_next_image(
        &self,
        store: &mut impl ImageStore,
        q: &QueryNextImageRequest,
    ) -> QueryResponse {
        let current = q.current;
        let Some(id) = store.search(
            current.manufacturer_id,
            current.image_type,
            q.hardware_version,
        ) else {
            debug!("no image for {current}");
            return QueryResponse::status(ZclStatus::NoImageAvailable);
        };

        let (cur, new) = (current.firmware_version, id.firmware_version);
        let allowed = match self.config.query_policy {
            QueryPolicy::UpgradeIfNewer => new > cur,
            QueryPolicy::DowngradeIfOlder => new < cur,
            QueryPolicy::ReinstallIfSame => new == cur,
            QueryPolicy::NoUpgrade => false,
        };
        if !allowed {
            debug!(
                "{:?} declines version 0x{new:08x} for 0x{cur:08x}",
                self.config.query_policy
            );
            return QueryResponse::status(ZclStatus::NoImageAvailable);
        }

        match store.total_size(&id) {
            Ok(size) => {
                info!("offering {id} size {size}");
                QueryResponse::offer(id, size)
            }
            Err(e) => {
                warn!("can't read size of {id}: {e}");
                QueryResponse::status(ZclStatus::NoImageAvailable)
            }
        }
    }

    /// Largest block that fits a message to `dest`
    pub fn block_size_for(&self, dest: NodeId, t: &mut impl Transport) -> u8 {
        let budget = t
            .max_payload(dest)
            .saturating_sub(ZCL_OVERHEAD + ImageBlockResponse::SUCCESS_OVERHEAD);
        let budget = u8::try_from(budget).unwrap_or(u8::MAX);
        self.config.max_block_size.min(budget)
    }

    /// Applies block policy, returning a response if the block is withheld
    fn block_policy(
        &mut self,
        req: &ImageBlockRequest,
        t: &mut impl Transport,
    ) -> Option<ImageBlockResponse<'static>> {
        match self.config.block_fault {
            BlockFault::SendBlock => (),
            BlockFault::DelayOnce => {
                self.config.block_fault = BlockFault::SendBlock;
                let now = t.utc_time();
                debug!("delaying block request once");
                return Some(ImageBlockResponse::WaitForData {
                    current_time: now,
                    request_time: now.saturating_add(BLOCK_FAULT_DELAY_S),
                    min_block_period: None,
                });
            }
            BlockFault::Abort if req.offset > 0 => {
                debug!("aborting block request at {}", req.offset);
                return Some(ImageBlockResponse::Status(ZclStatus::Abort));
            }
            BlockFault::Abort => (),
        }

        let period = self.config.min_block_period_ms;
        match req.min_block_period {
            Some(p) if period > 0 && p < period => {
                let now = t.utc_time();
                debug!("client block period {p} below {period}");
                Some(ImageBlockResponse::WaitForData {
                    current_time: now,
                    request_time: now,
                    min_block_period: Some(period),
                })
            }
            _ => None,
        }
    }

    fn image_block(
        &mut self,
        src: NodeId,
        req: &ImageBlockRequest,
        store: &mut impl ImageStore,
        t: &mut impl Transport,
    ) -> Result<()> {
        if let Some(r) = self.block_policy(req, t) {
            return t.send(src, &Message::ImageBlockResponse(r));
        }

        let size = (req.max_data_size.min(self.block_size_for(src, t))) as usize;
        let mut buf = [0u8; u8::MAX as usize];
        let r = match store.read(&req.id, req.offset, &mut buf[..size]) {
            Ok(l) if l > 0 => {
                trace!("block {} at {} len {l}", req.id, req.offset);
                ImageBlockResponse::Success {
                    id: req.id,
                    offset: req.offset,
                    data: &buf[..l],
                }
            }
            Ok(_) => {
                debug!("no data for {} at {}", req.id, req.offset);
                ImageBlockResponse::Status(ZclStatus::NoImageAvailable)
            }
            Err(e) => {
                debug!("read of {} failed: {e}", req.id);
                ImageBlockResponse::Status(ZclStatus::NoImageAvailable)
            }
        };
        t.send(src, &Message::ImageBlockResponse(r))
    }

    fn image_page(
        &mut self,
        src: NodeId,
        req: &ImagePageRequest,
        store: &mut impl ImageStore,
        t: &mut impl Transport,
    ) -> Result<()> {
        let status = self.start_page(src, req, store, t);
        if status == ZclStatus::Success {
            Ok(())
        } else {
            reject(t, src, Cmd::ImagePageRequest, status)
        }
    }

    fn start_page(
        &mut self,
        src: NodeId,
        req: &ImagePageRequest,
        store: &mut impl ImageStore,
        t: &mut impl Transport,
    ) -> ZclStatus {
        if !self.config.page_request_supported {
            return ZclStatus::UnsupClusterCommand;
        }
        if let Some(s) = &self.page {
            debug!("page request from 0x{src:04x}, busy with 0x{:04x}", s.dest);
            return ZclStatus::Failure;
        }
        let size = match store.total_size(&req.id) {
            Ok(s) if s > 0 => s,
            _ => return ZclStatus::NotFound,
        };
        if req.offset > size || req.max_data_size as u16 > req.page_size {
            return ZclStatus::InvalidValue;
        }

        let spacing = req.response_spacing.max(MIN_RESPONSE_SPACING_MS);
        let end = req.offset.saturating_add(req.page_size as u32).min(size);
        let block_size = req.max_data_size.min(self.block_size_for(src, t));
        debug!(
            "page request for {} at {}, {} bytes, spacing {spacing} ms",
            req.id, req.offset, req.page_size
        );
        self.page = Some(PageSession {
            dest: src,
            id: req.id,
            offset: req.offset,
            end,
            block_size,
            spacing_ms: spacing as u64,
            next_send: t.now(),
            sent: 0,
        });
        ZclStatus::Success
    }

    /// Sends due page request blocks
    pub fn progress(
        &mut self,
        store: &mut impl ImageStore,
        t: &mut impl Transport,
    ) {
        let Some(s) = self.page.as_mut() else {
            return;
        };
        let now = t.now();
        if now < s.next_send {
            return;
        }

        let mut buf = [0u8; u8::MAX as usize];
        let len = (s.end - s.offset).min(s.block_size as u32) as usize;
        let r = match store.read(&s.id, s.offset, &mut buf[..len]) {
            Ok(l) if l > 0 => l,
            r => {
                if let Err(e) = r {
                    debug!("page read of {} failed: {e}", s.id);
                }
                let m = Message::ImageBlockResponse(ImageBlockResponse::Status(
                    ZclStatus::NoImageAvailable,
                ));
                if let Err(e) = t.send(s.dest, &m) {
                    debug!("page abort to 0x{:04x} failed: {e}", s.dest);
                }
                self.page = None;
                return;
            }
        };

        s.sent += 1;
        let drop = match self.config.page_miss_modulus {
            Some(m) if m > 0 => s.sent % m == 0,
            _ => false,
        };
        if drop {
            debug!("dropping page block at {}", s.offset);
        } else {
            let m = Message::ImageBlockResponse(ImageBlockResponse::Success {
                id: s.id,
                offset: s.offset,
                data: &buf[..r],
            });
            if let Err(e) = t.send(s.dest, &m) {
                debug!("page block send failed: {e}");
            }
        }

        s.offset += r as u32;
        s.next_send = now + s.spacing_ms;
        if s.offset >= s.end {
            debug!("page request to 0x{:04x} done", s.dest);
            self.page = None;
        }
    }

    fn upgrade_end(
        &mut self,
        src: NodeId,
        req: &UpgradeEndRequest,
        t: &mut impl Transport,
    ) -> Result<()> {
        if req.status != ZclStatus::Success {
            info!(
                "client 0x{src:04x} failed download of {}: {:?}",
                req.id, req.status
            );
            return reject(t, src, Cmd::UpgradeEndRequest, ZclStatus::Abort);
        }

        let now = t.utc_time();
        let upgrade_time = match self.config.upgrade_policy {
            UpgradePolicy::Now => now,
            UpgradePolicy::Soon => now.saturating_add(UPGRADE_SOON_DELAY_S),
            UpgradePolicy::AskLater => UPGRADE_TIME_WAIT,
            UpgradePolicy::Abort => {
                info!("telling 0x{src:04x} to abort {}", req.id);
                return reject(t, src, Cmd::UpgradeEndRequest, ZclStatus::Abort);
            }
        };
        info!(
            "client 0x{src:04x} downloaded {}, policy {:?}",
            req.id, self.config.upgrade_policy
        );
        let r = UpgradeEndResponse {
            id: req.id,
            current_time: now,
            upgrade_time,
        };
        t.send(src, &Message::UpgradeEndResponse(r))
    }

    /// Announces an image to `dest`
    ///
    /// `payload_type` 0 to 3 selects how much of `id` is included.
    pub fn image_notify(
        &mut self,
        dest: NodeId,
        payload_type: u8,
        jitter: u8,
        id: &ImageId,
        t: &mut impl Transport,
    ) -> Result<()> {
        let payload = match payload_type {
            0 => NotifyPayload::JitterOnly,
            1 => NotifyPayload::Manufacturer(id.manufacturer_id),
            2 => {
                NotifyPayload::ManufacturerType(id.manufacturer_id, id.image_type)
            }
            3 => NotifyPayload::Full(*id),
            _ => return Err(OtaError::InvalidCall),
        };
        if jitter == 0 || jitter > ImageNotify::MAX_JITTER {
            return Err(OtaError::InvalidCall);
        }
        debug!("image notify to 0x{dest:04x}, {payload:?}");
        t.send(dest, &Message::ImageNotify(ImageNotify { jitter, payload }))
    }
}

fn reject(
    t: &mut impl Transport,
    dest: NodeId,
    cmd: Cmd,
    status: ZclStatus,
) -> Result<()> {
    trace!("rejecting {cmd:?} from 0x{dest:04x} with {status:?}");
    let r = DefaultResponse {
        command: cmd as u8,
        status,
    };
    t.send(dest, &Message::DefaultResponse(r))
}
