// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * OTA Upgrade client transfer engine.
 *
 * Copyright (c) 2024 Code Construct
 */

//! OTA client
//!
//! [`Client`] drives discovery, query, download, verification and apply
//! for a single device. It is polled from a cooperative loop through
//! [`Client::progress`], with incoming messages passed to
//! [`Client::receive`]. Radio, clock and platform hooks are supplied by
//! a [`Device`] implementation.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::page::{
    NextMissed, PageStatus, PageTracker, MISSED_BLOCK_DELAY_MS,
    PAGE_REQUEST_BLOCK_SIZE,
};
use crate::store::{DownloadStatus, ImageStore, Progress};
use crate::verify::{Crypto, Verifier, VerifyStatus};
use zigbee_ota::proto::{
    Cmd, DefaultResponse, ImageBlockRequest, ImageBlockResponse, ImageNotify,
    ImageOffer, ImagePageRequest, Message, QueryNextImageRequest,
    QueryResponse, UpgradeEndRequest, UpgradeEndResponse, UPGRADE_TIME_WAIT,
};
use zigbee_ota::{Eui64, ImageId, NodeId, OtaError, Result, ZclStatus};

/// Largest block a client will request
pub const MAX_CLIENT_DATA_SIZE: u8 = 63;

const MESSAGE_TIMEOUT_MS: u64 = 3000;
const MESSAGE_TIMEOUT_BACKOFF_MS: u64 = 2000;
const MAX_WAIT_MS: u64 = 60 * 60 * 1000;
const BLOCK_ERROR_DELAY_MS: u64 = 5 * 60 * 1000;
const UPGRADE_END_ERROR_DELAY_MS: u64 = 60 * 60 * 1000;
const WAIT_FOR_UPGRADE_DELAY_MS: u64 = 60 * 60 * 1000;
const IMMEDIATE_UPGRADE_DELAY_MS: u64 = 3000;
const VERIFY_DELAY_MS: u64 = 10;
const PAGE_RESPONSE_SPACING_MS: u16 = 20;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Consecutive block failures before a download is aborted
    pub download_error_threshold: u32,
    /// Unanswered or deferred upgrade requests before applying anyway
    pub upgrade_wait_threshold: u32,
    /// Interval between Query Next Image requests
    pub query_delay_ms: u64,
    /// Delay between block requests
    pub download_delay_ms: u64,
    /// Delay before retrying server discovery
    pub server_discovery_delay_ms: u64,
    /// Delay before repeating an Upgrade End Request
    pub run_upgrade_request_delay_ms: u64,
    /// Download using Image Page Requests
    pub use_page_request: bool,
    /// Page size for page requests, a multiple of 32
    pub page_request_size: u16,
    /// Time to wait for the blocks of a page
    pub page_request_timeout_ms: u64,
    /// Digest blocks per verification step, 0 for no limit
    pub max_hash_calculations: u32,
    /// Check image signatures before applying
    pub signature_verification: bool,
    /// Block size requested in block mode
    pub max_data_size: u8,
    /// Consecutive query failures before rediscovering the server
    pub query_error_threshold: u32,
    /// Download progress reporting interval, percent
    pub progress_update_percent: u32,
    /// Hardware version reported in queries
    pub hardware_version: Option<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_error_threshold: 10,
            upgrade_wait_threshold: 10,
            query_delay_ms: 5 * 60 * 1000,
            download_delay_ms: 0,
            server_discovery_delay_ms: 10 * 60 * 1000,
            run_upgrade_request_delay_ms: 10 * 60 * 1000,
            use_page_request: false,
            page_request_size: 1024,
            page_request_timeout_ms: 5000,
            max_hash_calculations: 10,
            signature_verification: true,
            max_data_size: MAX_CLIENT_DATA_SIZE,
            query_error_threshold: 10,
            progress_update_percent: 5,
            hardware_version: None,
        }
    }
}

/// How a download ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadResult {
    /// Downloaded and verified
    Success,
    /// The server aborted the transfer
    ServerAborted,
    /// The client gave up, after errors or on a storage failure
    ClientAborted,
    /// Verification failed
    VerifyFailed,
}

/// Client state, as reported externally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    DiscoverServer,
    QueryNextImage,
    Download,
    Verify,
    WaitForUpgrade,
    CountdownToUpgrade,
}

/// Platform hooks for a [`Client`]
pub trait Device {
    /// Signature verification provider
    type Crypto: Crypto;

    /// Monotonic time in milliseconds
    fn now(&mut self) -> u64;

    /// A random byte, used for notify jitter
    fn random(&mut self) -> u8;

    /// Sends an OTA cluster message to `dest`
    ///
    /// A failed send is retried after the response timeout.
    fn send(&mut self, dest: NodeId, msg: &Message) -> Result<()>;

    /// The currently running image
    fn current_image(&mut self) -> ImageId;

    /// Returns the crypto provider
    fn crypto(&mut self) -> &mut Self::Crypto;

    /// Starts looking for an OTA server
    ///
    /// The result is reported with [`Client::server_found`]. If no server
    /// is reported, discovery is retried after
    /// [`ClientConfig::server_discovery_delay_ms`].
    fn start_discovery(&mut self) {}

    /// A server offered an image. Returning `false` declines it.
    #[allow(unused)]
    fn new_image_available(&mut self, offer: &ImageOffer) -> bool {
        true
    }

    /// Periodic download progress
    #[allow(unused)]
    fn download_progress(&mut self, offset: u32, total: u32) {}

    /// Outcome of the signature check
    #[allow(unused)]
    fn verify_result(&mut self, id: &ImageId, status: VerifyStatus) {}

    /// Additional application checks once the signature is good
    ///
    /// `new` is set on the first call for an image. `InProgress` is
    /// polled again later.
    #[allow(unused)]
    fn custom_verify(&mut self, new: bool, id: &ImageId) -> VerifyStatus {
        VerifyStatus::Good
    }

    /// A download finished. Returning `false` on success refuses the image.
    #[allow(unused)]
    fn download_complete(&mut self, result: DownloadResult, id: &ImageId) -> bool {
        true
    }

    /// Installs the downloaded image
    fn bootload(&mut self, id: &ImageId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    DiscoverServer,
    QueryNextImage,
    Download {
        /// Waiting for storage to erase before writing
        erase_pending: bool,
    },
    Verify {
        /// Custom verify stage, `Some(first_call)` once the signature is good
        custom: Option<bool>,
    },
    WaitForUpgrade,
    Countdown,
}

impl From<&State> for ClientState {
    fn from(s: &State) -> ClientState {
        match s {
            State::Idle => Self::Idle,
            State::DiscoverServer => Self::DiscoverServer,
            State::QueryNextImage => Self::QueryNextImage,
            State::Download { .. } => Self::Download,
            State::Verify { .. } => Self::Verify,
            State::WaitForUpgrade => Self::WaitForUpgrade,
            State::Countdown => Self::CountdownToUpgrade,
        }
    }
}

/// The image being downloaded
#[derive(Debug, Clone, Copy)]
struct Target {
    id: ImageId,
    total: u32,
    offset: u32,
}

/// Converts a server's (current, target) time pair to a delay
///
/// Returns `None` if the target time has passed.
fn server_delay_ms(current: u32, target: u32) -> Option<u64> {
    let secs = target.checked_sub(current)?;
    Some((secs as u64 * 1000).min(MAX_WAIT_MS))
}

/// OTA client transfer engine
pub struct Client<C: Crypto> {
    config: ClientConfig,
    state: State,
    prev_state: ClientState,

    server: Option<(NodeId, Eui64)>,
    target: Option<Target>,

    /// Consecutive failures, of queries or block requests
    errors: u32,
    /// Set by the server, milliseconds
    min_block_period: u16,
    use_page_request: bool,
    page: PageTracker,
    verifier: Verifier<C>,
    last_percent: Option<u32>,

    /// Single shot timer
    deadline: Option<u64>,
    /// Delay requested while a response is outstanding
    next_event_ms: u64,
    waiting_response: bool,
}

impl<C: Crypto> Client<C> {
    /// Creates an idle client
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.max_data_size == 0 || config.max_data_size > MAX_CLIENT_DATA_SIZE
        {
            return Err(OtaError::InvalidCall);
        }
        let page = PageTracker::new(
            config.page_request_size,
            config.page_request_timeout_ms,
        )?;
        Ok(Self {
            use_page_request: config.use_page_request,
            config,
            state: State::Idle,
            prev_state: ClientState::Idle,
            server: None,
            target: None,
            errors: 0,
            min_block_period: 0,
            page,
            verifier: Verifier::new(),
            last_percent: None,
            deadline: None,
            next_event_ms: 0,
            waiting_response: false,
        })
    }

    /// Returns the configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the signature verifier, to add allowed signers
    pub fn verifier(&mut self) -> &mut Verifier<C> {
        &mut self.verifier
    }

    pub fn state(&self) -> ClientState {
        (&self.state).into()
    }

    pub fn prev_state(&self) -> ClientState {
        self.prev_state
    }

    /// The server in use
    pub fn server(&self) -> Option<(NodeId, Eui64)> {
        self.server
    }

    /// The image being downloaded or applied
    pub fn download_id(&self) -> Option<ImageId> {
        self.target.map(|t| t.id)
    }

    /// Current download offset
    pub fn offset(&self) -> u32 {
        self.target.map(|t| t.offset).unwrap_or(0)
    }

    /// Consecutive failure count
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Minimum block request period set by the server, milliseconds
    pub fn min_block_period(&self) -> u16 {
        self.min_block_period
    }

    /// Whether page requests are in use
    pub fn page_mode(&self) -> bool {
        self.use_page_request
    }

    /// Time of the next scheduled event
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Starts the client by discovering a server
    pub fn start(&mut self, dev: &mut impl Device<Crypto = C>) -> Result<()> {
        if self.state != State::Idle {
            return Err(OtaError::InvalidCall);
        }
        info!("starting OTA client");
        self.start_discovery(dev);
        Ok(())
    }

    /// Stops the client, abandoning any transfer
    ///
    /// A partial download is left in storage and resumed on the next
    /// [`start`](Self::start).
    pub fn stop(&mut self) {
        self.set_state(State::Idle);
        self.page.abort();
        self.verifier.abort();
        self.target = None;
        self.deadline = None;
        self.waiting_response = false;
    }

    /// Reports a discovered server
    pub fn server_found(
        &mut self,
        node: NodeId,
        eui: Eui64,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        if self.state != State::DiscoverServer {
            debug!("ignoring server {eui}, not discovering");
            return;
        }
        info!("using OTA server {eui} node 0x{node:04x}");
        self.server = Some((node, eui));
        self.determine_next_state(dev, store);
    }

    /// Runs timers and pending storage operations
    pub fn progress(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        let now = dev.now();
        let poll = store.poll(now);

        if self.state == (State::Download { erase_pending: true }) {
            match poll {
                Ok(Progress::InProgress) => (),
                Ok(Progress::Done) => {
                    debug!("storage ready");
                    self.state = State::Download {
                        erase_pending: false,
                    };
                    self.continue_download(dev);
                }
                Err(e) => {
                    error!("storage preparation failed: {e}");
                    self.finish(dev, store, DownloadResult::ClientAborted);
                }
            }
            return;
        }
        if let Err(e) = poll {
            error!("storage poll failed: {e}");
        }

        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                self.timer_expired(dev, store);
            }
            _ => (),
        }
    }

    /// Handles an incoming OTA cluster frame
    ///
    /// Malformed frames are dropped, returning an error.
    #[allow(clippy::too_many_arguments)]
    pub fn receive(
        &mut self,
        src: NodeId,
        broadcast: bool,
        cluster_specific: bool,
        cmd: u8,
        payload: &[u8],
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) -> Result<()> {
        let msg = Message::parse(cluster_specific, cmd, payload).map_err(|e| {
            debug!("dropping message 0x{cmd:02x} from 0x{src:04x}: {e}");
            e
        })?;
        self.handle(src, broadcast, &msg, dev, store);
        Ok(())
    }

    /// Handles a parsed message
    pub fn handle(
        &mut self,
        src: NodeId,
        broadcast: bool,
        msg: &Message,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        trace!("client rx {msg:?} from 0x{src:04x}");
        if let Message::ImageNotify(n) = msg {
            self.image_notify(broadcast, n, dev);
            return;
        }

        if self.server.map(|(n, _)| n) != Some(src) {
            debug!("ignoring message from 0x{src:04x}, not our server");
            return;
        }

        match msg {
            Message::QueryNextImageResponse(r) => {
                self.query_response(r, dev, store)
            }
            Message::ImageBlockResponse(r) => {
                self.block_response(r, dev, store)
            }
            Message::UpgradeEndResponse(r) => self.upgrade_end_response(r, dev),
            Message::DefaultResponse(r) => {
                self.default_response(r, dev, store)
            }
            m => debug!("unexpected client message 0x{:02x}", m.cmd_id()),
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!("client state {:?} -> {:?}", self.state, state);
        }
        self.prev_state = (&self.state).into();
        self.state = state;
    }

    /// Arms the timer
    ///
    /// While a response is outstanding the response timeout applies and
    /// `ms` is kept for when it arrives. Page requests use their own
    /// timeout.
    fn set_timer(&mut self, now: u64, ms: u64) {
        if self.waiting_response
            && self.page.status() != PageStatus::WaitingReplies
        {
            self.next_event_ms = ms;
            self.deadline = Some(now + MESSAGE_TIMEOUT_MS);
        } else {
            self.next_event_ms = 0;
            self.deadline = Some(now + ms);
        }
    }

    fn send_request(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        msg: &Message,
        timer_ms: u64,
    ) {
        let Some((node, _)) = self.server else {
            return;
        };
        self.waiting_response = true;
        if let Err(e) = dev.send(node, msg) {
            debug!("send failed: {e}");
        }
        let now = dev.now();
        self.set_timer(now, timer_ms);
    }

    fn timer_expired(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        self.page.timer_expired();
        let timed_out = core::mem::take(&mut self.waiting_response);
        if timed_out {
            debug!("response timeout in {:?}", self.state);
        }

        match self.state {
            State::Idle => (),
            State::DiscoverServer => self.start_discovery(dev),
            State::QueryNextImage => self.query_next_image(dev, true, timed_out),
            State::Download { erase_pending } => {
                if timed_out {
                    self.errors += 1;
                    let ms = self.next_event_ms.max(MESSAGE_TIMEOUT_BACKOFF_MS);
                    let now = dev.now();
                    self.set_timer(now, ms);
                } else if !erase_pending {
                    self.continue_download(dev);
                }
            }
            State::Verify { .. } => self.continue_verification(dev, store, false),
            State::WaitForUpgrade => {
                if timed_out {
                    self.errors += 1;
                }
                self.ask_server_to_run_upgrade(dev, true);
            }
            State::Countdown => self.run_upgrade(dev),
        }
    }

    fn start_discovery(&mut self, dev: &mut impl Device<Crypto = C>) {
        self.restart_discovery_after_delay(dev);
        debug!("starting server discovery");
        dev.start_discovery();
    }

    fn restart_discovery_after_delay(&mut self, dev: &mut impl Device<Crypto = C>) {
        self.set_state(State::DiscoverServer);
        self.server = None;
        self.errors = 0;
        self.waiting_response = false;
        let now = dev.now();
        self.set_timer(now, self.config.server_discovery_delay_ms);
    }

    /// Resumes or verifies a download left in storage, or starts querying
    fn determine_next_state(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        let t = store.check_temp();
        let running = dev.current_image();
        match t.status {
            DownloadStatus::PartialFound => {
                info!("resuming download of {} at {}/{}", t.id, t.offset, t.total);
                self.target = Some(Target {
                    id: t.id,
                    total: t.total,
                    offset: t.offset,
                });
                self.errors = 0;
                self.min_block_period = 0;
                self.last_percent = None;
                match store.prepare_to_resume() {
                    Ok(Progress::Done) => {
                        self.set_state(State::Download {
                            erase_pending: false,
                        });
                        self.continue_download(dev);
                    }
                    Ok(Progress::InProgress) => {
                        self.set_state(State::Download {
                            erase_pending: true,
                        });
                    }
                    Err(e) => {
                        error!("can't resume download: {e}");
                        self.set_state(State::Download {
                            erase_pending: false,
                        });
                        self.finish(dev, store, DownloadResult::ClientAborted);
                    }
                }
            }
            DownloadStatus::Complete
                if t.id.firmware_version != running.firmware_version =>
            {
                info!("verifying stored image {}", t.id);
                self.target = Some(Target {
                    id: t.id,
                    total: t.total,
                    offset: t.total,
                });
                self.continue_verification(dev, store, true);
            }
            _ => self.query_next_image(dev, true, false),
        }
    }

    fn query_next_image(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        send_now: bool,
        error: bool,
    ) {
        if self.state != State::QueryNextImage {
            self.errors = 0;
        }
        self.set_state(State::QueryNextImage);
        self.target = None;
        if self.server.is_none() {
            self.restart_discovery_after_delay(dev);
            return;
        }

        if error {
            self.errors += 1;
            if self.errors >= self.config.query_error_threshold {
                warn!("{} query errors, rediscovering server", self.errors);
                self.restart_discovery_after_delay(dev);
                return;
            }
        }

        if !send_now {
            let now = dev.now();
            self.set_timer(now, self.config.query_delay_ms);
            return;
        }

        let current = dev.current_image();
        trace!("query next image, running {current}");
        let msg = Message::QueryNextImageRequest(QueryNextImageRequest {
            current,
            hardware_version: self.config.hardware_version,
        });
        self.send_request(dev, &msg, self.config.query_delay_ms);
    }

    fn image_notify(
        &mut self,
        broadcast: bool,
        n: &ImageNotify,
        dev: &mut impl Device<Crypto = C>,
    ) {
        if self.state != State::QueryNextImage || self.waiting_response {
            debug!("ignoring image notify in {:?}", self.state);
            return;
        }

        if broadcast {
            if n.jitter == 0 || n.jitter > ImageNotify::MAX_JITTER {
                debug!("image notify jitter {} out of range", n.jitter);
                return;
            }
            let current = dev.current_image();
            let pattern = n.payload.as_pattern();
            let p = ImageId {
                firmware_version: ImageId::WILDCARD_VERSION,
                ..pattern
            };
            if !current.matches(&p) {
                debug!("image notify for another image type");
                return;
            }
            if pattern.firmware_version == current.firmware_version {
                debug!("image notify for the running version");
                return;
            }
            if n.jitter < ImageNotify::MAX_JITTER {
                let r = dev.random() % ImageNotify::MAX_JITTER + 1;
                if r > n.jitter {
                    trace!("image notify jitter {r} > {}, not querying", n.jitter);
                    return;
                }
            }
        }

        debug!("image notify, querying");
        self.query_next_image(dev, true, false);
    }

    fn query_response(
        &mut self,
        r: &QueryResponse,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        if self.state != State::QueryNextImage {
            debug!("unexpected query response in {:?}", self.state);
            return;
        }
        self.waiting_response = false;

        let offer = match (r.status, r.offer) {
            (ZclStatus::Success, Some(o)) => o,
            (s, _) => {
                debug!("no image available ({s:?})");
                self.errors = 0;
                self.query_next_image(dev, false, false);
                return;
            }
        };

        let current = dev.current_image();
        if !offer.id.same_image_type(&current) || offer.size == 0 {
            warn!("invalid offer {} size {}", offer.id, offer.size);
            self.query_next_image(dev, false, true);
            return;
        }
        if offer.size > store.max_download_size() {
            warn!(
                "offered image size {} exceeds storage {}",
                offer.size,
                store.max_download_size()
            );
            self.query_next_image(dev, false, true);
            return;
        }
        if !dev.new_image_available(&offer) {
            info!("declined image {}", offer.id);
            self.query_next_image(dev, false, false);
            return;
        }

        self.start_download(&offer, dev, store);
    }

    fn start_download(
        &mut self,
        offer: &ImageOffer,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        info!("downloading {} size {}", offer.id, offer.size);
        self.target = Some(Target {
            id: offer.id,
            total: offer.size,
            offset: 0,
        });
        self.errors = 0;
        self.min_block_period = 0;
        self.last_percent = None;
        self.use_page_request = self.config.use_page_request;
        self.page.abort();

        match store.clear_temp() {
            Ok(Progress::Done) => {
                let id = offer.id;
                if let Some(old) = store.search(
                    id.manufacturer_id,
                    id.image_type,
                    self.config.hardware_version,
                ) {
                    debug!("removing old image {old}");
                    if let Err(e) = store.delete(&old) {
                        warn!("failed removing {old}: {e}");
                    }
                }
                self.set_state(State::Download {
                    erase_pending: false,
                });
                self.continue_download(dev);
            }
            Ok(Progress::InProgress) => {
                debug!("waiting for storage erase");
                self.set_state(State::Download {
                    erase_pending: true,
                });
            }
            Err(e) => {
                error!("can't clear download storage: {e}");
                self.set_state(State::Download {
                    erase_pending: false,
                });
                self.finish(dev, store, DownloadResult::ClientAborted);
            }
        }
    }

    /// Sends the next block or page request
    fn continue_download(&mut self, dev: &mut impl Device<Crypto = C>) {
        let Some(target) = self.target.as_mut() else {
            return;
        };

        if self.errors >= self.config.download_error_threshold {
            warn!("{} consecutive download errors", self.errors);
            self.abort_download(dev);
            return;
        }

        let mut timer = self.config.download_delay_ms;
        let mut page_request = false;
        if self.use_page_request {
            if !self.page.handling() {
                timer = self.page.init(target.offset, target.total);
                page_request = true;
            } else {
                match self.page.next_missed() {
                    NextMissed::Block(o) => target.offset = o,
                    NextMissed::Complete => {
                        self.page.abort();
                        target.offset =
                            self.page.finished_offset().min(target.total);
                        timer = self.page.init(target.offset, target.total);
                        page_request = true;
                    }
                    NextMissed::Error => {
                        self.errors += 1;
                        let now = dev.now();
                        self.set_timer(now, timer);
                        return;
                    }
                }
            }
        }

        let id = target.id;
        let offset = target.offset;
        let msg = if page_request {
            trace!("page request at {offset}");
            Message::ImagePageRequest(ImagePageRequest {
                id,
                offset,
                max_data_size: PAGE_REQUEST_BLOCK_SIZE as u8,
                page_size: self.config.page_request_size,
                response_spacing: PAGE_RESPONSE_SPACING_MS,
                request_node: None,
            })
        } else {
            let max_data_size = if self.use_page_request {
                PAGE_REQUEST_BLOCK_SIZE as u8
            } else {
                self.config.max_data_size
            };
            trace!("block request at {offset}");
            Message::ImageBlockRequest(ImageBlockRequest {
                id,
                offset,
                max_data_size,
                request_node: None,
                min_block_period: Some(self.min_block_period),
            })
        };
        self.send_request(dev, &msg, timer);
    }

    /// Gives up on the download after repeated failures
    fn abort_download(&mut self, dev: &mut impl Device<Crypto = C>) {
        let Some(target) = self.target else {
            return;
        };
        self.page.abort();
        dev.download_complete(DownloadResult::ClientAborted, &target.id);
        self.send_upgrade_end_failure(dev, ZclStatus::Abort, &target.id);
        self.query_next_image(dev, false, false);
    }

    fn fall_back_to_blocks(&mut self, dev: &mut impl Device<Crypto = C>) {
        info!("server doesn't support page requests, using blocks");
        self.use_page_request = false;
        self.page.abort();
        self.continue_download(dev);
    }

    fn block_response(
        &mut self,
        r: &ImageBlockResponse,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        if self.state != (State::Download { erase_pending: false }) {
            debug!("unexpected block response in {:?}", self.state);
            return;
        }

        match *r {
            ImageBlockResponse::Success { id, offset, data } => {
                self.block_data(&id, offset, data, dev, store)
            }
            ImageBlockResponse::WaitForData {
                current_time,
                request_time,
                min_block_period,
            } => {
                self.waiting_response = false;
                let ms = server_delay_ms(current_time, request_time)
                    .unwrap_or_else(|| {
                        debug!("bad server wait time, using error delay");
                        BLOCK_ERROR_DELAY_MS
                    });
                if let Some(p) = min_block_period {
                    debug!("minimum block period now {p} ms");
                    self.min_block_period = p;
                }
                debug!("server asked to wait {ms} ms");
                let now = dev.now();
                self.set_timer(now, ms);
            }
            ImageBlockResponse::Status(
                s @ (ZclStatus::Abort | ZclStatus::NoImageAvailable),
            ) => {
                self.waiting_response = false;
                warn!("server aborted download ({s:?})");
                self.finish(dev, store, DownloadResult::ServerAborted);
            }
            ImageBlockResponse::Status(ZclStatus::UnsupClusterCommand) => {
                self.waiting_response = false;
                if self.use_page_request && self.page.handling() {
                    self.fall_back_to_blocks(dev);
                } else {
                    warn!("server doesn't support block requests");
                    self.finish(dev, store, DownloadResult::ServerAborted);
                }
            }
            ImageBlockResponse::Status(s) => {
                // the response timeout counts it as a failure
                debug!("ignoring block response {s:?}");
            }
        }
    }

    fn block_data(
        &mut self,
        id: &ImageId,
        offset: u32,
        data: &[u8],
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        let Some(target) = self.target else {
            return;
        };
        let paging = self.use_page_request && self.page.handling();

        if !(paging && self.page.status() == PageStatus::WaitingReplies)
            && offset != target.offset
        {
            debug!("block at {offset}, expected {}", target.offset);
            return;
        }
        if !id.same_triplet(&target.id) {
            debug!("block for another image {id}");
            return;
        }
        if data.is_empty() || data.len() > MAX_CLIENT_DATA_SIZE as usize {
            debug!("bad block length {}", data.len());
            return;
        }
        self.waiting_response = false;
        self.errors = 0;

        let page_status = if paging {
            match self.page.note_received(offset) {
                PageStatus::AlreadyReceived => return,
                PageStatus::Error => {
                    warn!("page block at {offset} is invalid");
                    self.finish(dev, store, DownloadResult::ClientAborted);
                    return;
                }
                s => Some(s),
            }
        } else {
            None
        };

        let written = match page_status {
            Some(s) => {
                let saved = if s == PageStatus::Complete {
                    self.page.finished_offset()
                } else {
                    self.page.received_offset()
                };
                store.write_temp_unsaved(offset, data).and_then(|_| {
                    store.save_temp_offset(saved.min(target.total))
                })
            }
            None => store.write_temp(offset, data),
        };
        if let Err(e) = written {
            error!("failed writing download: {e}");
            self.finish(dev, store, DownloadResult::ClientAborted);
            return;
        }

        let mut next = offset + data.len() as u32;
        let mut timer =
            self.config.download_delay_ms.max(self.min_block_period as u64);
        match page_status {
            Some(PageStatus::WaitingReplies) => return,
            Some(PageStatus::Complete) => next = self.page.finished_offset(),
            Some(PageStatus::RetryMissed) => timer = MISSED_BLOCK_DELAY_MS,
            _ => (),
        }

        let next = next.min(target.total);
        if let Some(t) = self.target.as_mut() {
            t.offset = next;
        }
        self.report_progress(dev, next, target.total);

        if next >= target.total {
            info!("download of {} complete", target.id);
            if let Err(e) = store.finish_download(next) {
                error!("failed finishing download: {e}");
                self.finish(dev, store, DownloadResult::ClientAborted);
                return;
            }
            self.continue_verification(dev, store, true);
            return;
        }
        let now = dev.now();
        self.set_timer(now, timer);
    }

    fn report_progress(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        offset: u32,
        total: u32,
    ) {
        let pct = (offset as u64 * 100 / total.max(1) as u64) as u32;
        let step = self.config.progress_update_percent.max(1);
        let report = match self.last_percent {
            None => true,
            Some(last) => pct >= last + step || (pct == 100 && last != 100),
        };
        if report {
            info!("download {pct}% ({offset}/{total})");
            self.last_percent = Some(pct);
            dev.download_progress(offset, total);
        }
    }

    fn continue_verification(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
        new: bool,
    ) {
        let Some(target) = self.target else {
            return;
        };

        if new {
            self.set_state(State::Verify { custom: None });
            let t = store.check_temp();
            if t.status != DownloadStatus::Complete {
                warn!("downloaded image is incomplete ({:?})", t.status);
                self.finish(dev, store, DownloadResult::VerifyFailed);
                return;
            }
        }

        let State::Verify { custom } = self.state else {
            return;
        };

        let status = match custom {
            None if !self.config.signature_verification => VerifyStatus::Good,
            None => self.verifier.verify(
                store,
                dev.crypto(),
                &target.id,
                new,
                self.config.max_hash_calculations,
            ),
            Some(first) => {
                self.state = State::Verify {
                    custom: Some(false),
                };
                dev.custom_verify(first, &target.id)
            }
        };

        let now = dev.now();
        match (custom, status) {
            (_, VerifyStatus::InProgress) => self.set_timer(now, VERIFY_DELAY_MS),
            (_, VerifyStatus::Wait) => self.set_timer(now, 0),
            (None, VerifyStatus::Good) => {
                dev.verify_result(&target.id, status);
                self.state = State::Verify { custom: Some(true) };
                self.continue_verification(dev, store, false);
            }
            (Some(_), VerifyStatus::Good) => {
                self.finish(dev, store, DownloadResult::Success)
            }
            (c, s) => {
                if c.is_none() {
                    dev.verify_result(&target.id, s);
                }
                warn!("verification of {} failed ({s:?})", target.id);
                self.finish(dev, store, DownloadResult::VerifyFailed);
            }
        }
    }

    fn send_upgrade_end_failure(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        status: ZclStatus,
        id: &ImageId,
    ) {
        let Some((node, _)) = self.server else {
            return;
        };
        let msg = Message::UpgradeEndRequest(UpgradeEndRequest { status, id: *id });
        if let Err(e) = dev.send(node, &msg) {
            debug!("upgrade end send failed: {e}");
        }
    }

    /// Ends a download or verification
    fn finish(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
        result: DownloadResult,
    ) {
        if !matches!(self.state, State::Download { .. } | State::Verify { .. }) {
            return;
        }
        let Some(target) = self.target else {
            return;
        };
        self.page.abort();
        self.verifier.abort();
        self.waiting_response = false;

        let mut result = result;
        if !dev.download_complete(result, &target.id)
            && result == DownloadResult::Success
        {
            warn!("application refused image {}", target.id);
            result = DownloadResult::ClientAborted;
        }

        if result == DownloadResult::Success {
            info!("image {} ready, asking server to upgrade", target.id);
            self.ask_server_to_run_upgrade(dev, false);
            return;
        }

        warn!("download of {} ended: {result:?}", target.id);
        if result == DownloadResult::VerifyFailed {
            if let Err(e) = store.clear_temp() {
                error!("failed discarding image: {e}");
            }
        }
        if result != DownloadResult::ServerAborted {
            let status = if result == DownloadResult::VerifyFailed {
                ZclStatus::InvalidImage
            } else {
                ZclStatus::Abort
            };
            self.send_upgrade_end_failure(dev, status, &target.id);
        }
        self.query_next_image(dev, false, false);
    }

    fn ask_server_to_run_upgrade(
        &mut self,
        dev: &mut impl Device<Crypto = C>,
        timeout: bool,
    ) {
        let Some(target) = self.target else {
            return;
        };
        self.set_state(State::WaitForUpgrade);
        if !timeout {
            self.errors = 0;
        }
        if self.errors >= self.config.upgrade_wait_threshold {
            warn!("no upgrade permission after {} attempts, applying", self.errors);
            self.run_upgrade(dev);
            return;
        }
        let msg = Message::UpgradeEndRequest(UpgradeEndRequest {
            status: ZclStatus::Success,
            id: target.id,
        });
        self.send_request(dev, &msg, self.config.run_upgrade_request_delay_ms);
    }

    fn upgrade_end_response(
        &mut self,
        r: &UpgradeEndResponse,
        dev: &mut impl Device<Crypto = C>,
    ) {
        if !matches!(self.state, State::WaitForUpgrade | State::Countdown) {
            debug!("unexpected upgrade end response in {:?}", self.state);
            return;
        }
        let Some(target) = self.target else {
            return;
        };
        if !target.id.matches(&r.id) {
            debug!("upgrade end response for {}", r.id);
            return;
        }
        self.waiting_response = false;
        let now = dev.now();

        if r.upgrade_time == UPGRADE_TIME_WAIT {
            self.errors += 1;
            debug!("server deferred upgrade ({} times)", self.errors);
            self.set_state(State::WaitForUpgrade);
            self.set_timer(now, WAIT_FOR_UPGRADE_DELAY_MS);
            return;
        }

        let ms = server_delay_ms(r.current_time, r.upgrade_time)
            .unwrap_or_else(|| {
                debug!("bad upgrade time, using error delay");
                UPGRADE_END_ERROR_DELAY_MS
            })
            .max(IMMEDIATE_UPGRADE_DELAY_MS);
        info!("upgrading {} in {} s", target.id, ms / 1000);
        self.set_state(State::Countdown);
        self.set_timer(now, ms);
    }

    fn default_response(
        &mut self,
        r: &DefaultResponse,
        dev: &mut impl Device<Crypto = C>,
        store: &mut impl ImageStore,
    ) {
        trace!("default response {r:?}");
        if r.command == Cmd::ImagePageRequest as u8
            || r.command == Cmd::ImageBlockRequest as u8
        {
            self.block_response(&ImageBlockResponse::Status(r.status), dev, store);
        } else if r.command == Cmd::UpgradeEndRequest as u8
            && r.status != ZclStatus::Success
            && self.state == State::WaitForUpgrade
        {
            self.waiting_response = false;
            warn!("server refused upgrade ({:?})", r.status);
            dev.download_complete(
                DownloadResult::ServerAborted,
                &self.target.map(|t| t.id).unwrap_or(ImageId::INVALID),
            );
            self.query_next_image(dev, false, false);
        } else if r.command == Cmd::QueryNextImageRequest as u8
            && self.state == State::QueryNextImage
        {
            self.waiting_response = false;
            debug!("query rejected ({:?})", r.status);
            self.query_next_image(dev, false, false);
        }
    }

    fn run_upgrade(&mut self, dev: &mut impl Device<Crypto = C>) {
        let Some(target) = self.target else {
            return;
        };
        info!("applying image {}", target.id);
        dev.bootload(&target.id);
        self.query_next_image(dev, false, false);
    }
}
