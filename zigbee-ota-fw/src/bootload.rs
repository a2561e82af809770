// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Standalone bootloader server.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Standalone bootloader
//!
//! Pushes the upgrade tag of a stored image to a neighbouring device's
//! standalone bootloader. The target is queried, asked to launch its
//! bootloader if not already running, authenticated by a challenge and
//! then sent the image with [`XmodemSender`].
//!
//! Messages are addressed by EUI64. Every message starts with the
//! protocol version and a [`MsgType`].

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use nom::{
    bytes::complete::take,
    number::complete::{be_u16, le_u8},
    sequence::tuple,
    IResult,
};

use crate::store::ImageStore;
use crate::verify::Crypto;
use crate::xmodem::{MsgType, XmodemSender, XmodemStatus, XMODEM_FRAME_LEN};
use crate::{ImageRead, TAG_UPGRADE_IMAGE};
use zigbee_ota::{
    Eui64, ImageId, NoneNoSpace, OtaError, Result, SliceWriter,
};

/// Bootload protocol version
pub const BOOTLOAD_VERSION: u8 = 1;
/// Expected auth challenge version
pub const CHALLENGE_VERSION: u8 = 1;
/// Length of a hardware tag
pub const HARDWARE_TAG_LEN: usize = 16;

const HEADER_LEN: usize = 2;
const QUERY_RESPONSE_LEN: usize = HEADER_LEN + 25;
const CHALLENGE_LEN: usize = 16;
const AUTH_CHALLENGE_LEN: usize = HEADER_LEN + 17;

/// Bootload timing and credentials
#[derive(Debug, Clone)]
pub struct BootloadConfig {
    /// Wait for a query response
    pub query_timeout_ms: u64,
    /// Wait for an auth challenge after a launch request
    pub launch_timeout_ms: u64,
    /// Wait after authenticating before querying again
    pub recheck_delay_ms: u64,
    /// Wait for an XMODEM reply
    pub xmodem_timeout_ms: u64,
    /// Resends of a single XMODEM frame
    pub xmodem_retries: u8,
    /// Shared challenge key
    pub key: [u8; 16],
}

impl Default for BootloadConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 2000,
            launch_timeout_ms: 2000,
            recheck_delay_ms: 2000,
            xmodem_timeout_ms: 2000,
            xmodem_retries: 5,
            key: [0; 16],
        }
    }
}

/// Capabilities reported in a query response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub eui64: Eui64,
    /// The standalone bootloader is running
    pub bootloader_active: bool,
    pub manufacturer_id: u16,
    pub hardware_tag: [u8; HARDWARE_TAG_LEN],
    pub capabilities: u8,
    pub platform: u8,
    pub micro: u8,
    pub phy: u8,
    pub bootloader_version: u16,
}

impl TargetInfo {
    /// Parses a query response payload following the header
    pub fn parse(eui64: Eui64, buf: &[u8]) -> IResult<&[u8], Self> {
        let (
            rest,
            (active, manufacturer_id, tag, capabilities, platform, micro, phy, bl),
        ) = tuple((
            le_u8,
            be_u16,
            take(HARDWARE_TAG_LEN),
            le_u8,
            le_u8,
            le_u8,
            le_u8,
            be_u16,
        ))(buf)?;
        let mut hardware_tag = [0u8; HARDWARE_TAG_LEN];
        hardware_tag.copy_from_slice(tag);
        Ok((
            rest,
            Self {
                eui64,
                bootloader_active: active != 0,
                manufacturer_id,
                hardware_tag,
                capabilities,
                platform,
                micro,
                phy,
                bootloader_version: bl,
            },
        ))
    }
}

/// Radio and callbacks for [`BootloadServer`]
pub trait BootloadTransport {
    /// Current time in milliseconds
    fn now(&mut self) -> u64;

    /// Sends a message, broadcast when `dest` is `None`
    fn send(&mut self, dest: Option<&Eui64>, msg: &[u8]) -> Result<()>;

    /// A query response arrived
    ///
    /// `broadcast` is set for replies to [`BootloadServer::broadcast_query`].
    fn query_response(&mut self, _broadcast: bool, _info: &TargetInfo) {}

    /// A bootload session ended
    fn finished(&mut self, _success: bool) {}
}

#[derive(Debug)]
enum State {
    None,
    QuerySent,
    LaunchRequestSent,
    DelayBeforeRecheck,
    RecheckSent,
    SendingData(XmodemSender),
}

/// Public bootload session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloadState {
    None,
    QuerySent,
    LaunchRequestSent,
    DelayBeforeRecheck,
    RecheckSent,
    SendingData,
}

impl From<&State> for BootloadState {
    fn from(s: &State) -> BootloadState {
        match s {
            State::None => Self::None,
            State::QuerySent => Self::QuerySent,
            State::LaunchRequestSent => Self::LaunchRequestSent,
            State::DelayBeforeRecheck => Self::DelayBeforeRecheck,
            State::RecheckSent => Self::RecheckSent,
            State::SendingData(_) => Self::SendingData,
        }
    }
}

/// The image region being sent
#[derive(Debug, Clone, Copy)]
struct Source {
    id: ImageId,
    offset: u32,
    size: u32,
}

/// Reads a tag's payload from a stored image
struct TagSource<'a, S> {
    store: &'a mut S,
    src: Source,
}

impl<S: ImageStore> ImageRead for TagSource<'_, S> {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.src.size {
            return Ok(0);
        }
        let l = ((self.src.size - offset) as usize).min(buf.len());
        self.store
            .read(&self.src.id, self.src.offset + offset, &mut buf[..l])
    }
}

/// Standalone bootloader server
///
/// Only one target is handled at a time. Call [`progress`](Self::progress)
/// regularly to handle timeouts.
#[derive(Debug)]
pub struct BootloadServer {
    config: BootloadConfig,
    state: State,
    target: Option<TargetInfo>,
    target_eui: Option<Eui64>,
    source: Option<Source>,
    deadline: Option<u64>,
}

impl BootloadServer {
    pub fn new(config: BootloadConfig) -> Self {
        Self {
            config,
            state: State::None,
            target: None,
            target_eui: None,
            source: None,
            deadline: None,
        }
    }

    pub fn state(&self) -> BootloadState {
        (&self.state).into()
    }

    /// Information from the most recent query response
    pub fn current_target(&self) -> Option<&TargetInfo> {
        self.target.as_ref()
    }

    /// Time of the next scheduled event
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    fn set_state(&mut self, state: State) {
        trace!(
            "bootload state {:?} -> {:?}",
            BootloadState::from(&self.state),
            BootloadState::from(&state)
        );
        self.state = state;
    }

    fn send_header_only(
        &self,
        t: &mut impl BootloadTransport,
        dest: Option<&Eui64>,
        ty: MsgType,
    ) -> Result<()> {
        t.send(dest, &[BOOTLOAD_VERSION, ty as u8])
    }

    /// Broadcasts a query
    ///
    /// Responses are passed to [`BootloadTransport::query_response`].
    pub fn broadcast_query(
        &mut self,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        if !matches!(self.state, State::None) {
            return Err(OtaError::InvalidCall);
        }
        debug!("broadcasting bootloader query");
        self.send_header_only(t, None, MsgType::Query)
    }

    /// Starts bootloading image `id` onto `target`
    ///
    /// Only the image's upgrade tag is sent.
    pub fn start(
        &mut self,
        target: Eui64,
        id: &ImageId,
        store: &mut impl ImageStore,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        if !matches!(self.state, State::None) {
            return Err(OtaError::InvalidCall);
        }
        if !id.is_valid() {
            return Err(OtaError::NotFound);
        }
        if store.total_size(id).unwrap_or(0) == 0 {
            warn!("no image {id} to bootload");
            return Err(OtaError::NotFound);
        }
        let (offset, size) =
            store.image(*id).tag_offset_and_size(TAG_UPGRADE_IMAGE)?;

        self.send_header_only(t, Some(&target), MsgType::Query)?;
        info!("bootloading {id} to {target}, {size} bytes");
        self.source = Some(Source { id: *id, offset, size });
        self.target_eui = Some(target);
        self.deadline = Some(t.now() + self.config.query_timeout_ms);
        self.set_state(State::QuerySent);
        Ok(())
    }

    /// Starts bootloading the target of the last query response
    pub fn start_with_current_target(
        &mut self,
        id: &ImageId,
        store: &mut impl ImageStore,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        let target = self.target.ok_or(OtaError::NotFound)?;
        self.start(target.eui64, id, store, t)
    }

    fn finish(&mut self, success: bool, t: &mut impl BootloadTransport) {
        if success {
            info!("bootload complete");
        } else {
            warn!("bootload failed in state {:?}", self.state());
        }
        self.set_state(State::None);
        self.deadline = None;
        self.source = None;
        self.target_eui = None;
        t.finished(success);
    }

    fn send_launch_request(
        &mut self,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        let (Some(target), Some(dest)) = (self.target, self.target_eui) else {
            return Err(OtaError::InvalidCall);
        };
        let mut b = [0u8; HEADER_LEN + 2 + HARDWARE_TAG_LEN];
        let mut w = SliceWriter::new(&mut b);
        w.push_le8(BOOTLOAD_VERSION).space()?;
        w.push_le8(MsgType::LaunchRequest as u8).space()?;
        w.push_le16(target.manufacturer_id).space()?;
        w.push(&target.hardware_tag).space()?;
        debug!("sending launch request to {dest}");
        t.send(Some(&dest), w.done())?;
        self.deadline = Some(t.now() + self.config.launch_timeout_ms);
        self.set_state(State::LaunchRequestSent);
        Ok(())
    }

    fn send_frame(
        &mut self,
        store: &mut impl ImageStore,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        let State::SendingData(x) = &self.state else {
            return Err(OtaError::InvalidCall);
        };
        let (Some(src), Some(dest)) = (self.source, self.target_eui) else {
            return Err(OtaError::InvalidCall);
        };
        let mut b = [0u8; XMODEM_FRAME_LEN];
        let l = x.write_frame(&mut TagSource { store, src }, &mut b)?;
        t.send(Some(&dest), &b[..l])?;
        self.deadline = Some(t.now() + self.config.xmodem_timeout_ms);
        Ok(())
    }

    fn start_sending(
        &mut self,
        store: &mut impl ImageStore,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        let src = self.source.ok_or(OtaError::InvalidCall)?;
        info!("starting xmodem transfer");
        self.set_state(State::SendingData(XmodemSender::new(
            BOOTLOAD_VERSION,
            src.size,
            self.config.xmodem_retries,
        )));
        self.send_frame(store, t)
    }

    /// Handles a message from `src`
    ///
    /// Messages with a different protocol version, short messages and
    /// messages from nodes other than the current target are dropped.
    pub fn receive(
        &mut self,
        src: &Eui64,
        msg: &[u8],
        store: &mut impl ImageStore,
        crypto: &mut impl Crypto,
        t: &mut impl BootloadTransport,
    ) {
        if msg.len() < HEADER_LEN || msg[0] != BOOTLOAD_VERSION {
            debug!("dropping bootload message, bad header");
            return;
        }
        let ty = msg[1];

        if let Some(target) = self.target_eui {
            if target != *src {
                debug!("ignoring bootload message from {src}");
                return;
            }
        }

        let r = match num_traits::FromPrimitive::from_u8(ty) {
            Some(MsgType::QueryResponse) => {
                self.query_response(src, msg, store, t)
            }
            Some(MsgType::AuthChallenge) => self.challenge(msg, crypto, t),
            Some(_) => self.xmodem_reply(ty, store, t),
            None => {
                debug!("unknown bootload message 0x{ty:02x}");
                Ok(())
            }
        };
        if let Err(e) = r {
            warn!("bootload send failed: {e}");
            self.finish(false, t);
        }
    }

    fn query_response(
        &mut self,
        src: &Eui64,
        msg: &[u8],
        store: &mut impl ImageStore,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        if msg.len() < QUERY_RESPONSE_LEN {
            debug!("short query response, {} bytes", msg.len());
            return Ok(());
        }
        let Ok((_, info)) = TargetInfo::parse(*src, &msg[HEADER_LEN..]) else {
            return Ok(());
        };
        trace!("query response {info:?}");

        match self.state {
            State::None => {
                self.target = Some(info);
                t.query_response(true, &info);
                Ok(())
            }
            State::QuerySent => {
                self.target = Some(info);
                t.query_response(false, &info);
                if info.bootloader_active {
                    self.start_sending(store, t)
                } else {
                    self.send_launch_request(t)
                }
            }
            State::RecheckSent => {
                self.target = Some(info);
                if info.bootloader_active {
                    self.start_sending(store, t)
                } else {
                    warn!("bootloader did not launch on {src}");
                    self.finish(false, t);
                    Ok(())
                }
            }
            _ => {
                debug!("unexpected query response");
                Ok(())
            }
        }
    }

    fn challenge(
        &mut self,
        msg: &[u8],
        crypto: &mut impl Crypto,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        if !matches!(self.state, State::LaunchRequestSent) {
            debug!("unexpected auth challenge");
            return Ok(());
        }
        if msg.len() < AUTH_CHALLENGE_LEN {
            debug!("short auth challenge, {} bytes", msg.len());
            return Ok(());
        }
        if msg[HEADER_LEN] != CHALLENGE_VERSION {
            warn!("auth challenge version {} unsupported", msg[HEADER_LEN]);
            return Ok(());
        }
        let Some(dest) = self.target_eui else {
            return Err(OtaError::InvalidCall);
        };

        let mut c = [0u8; CHALLENGE_LEN];
        c.copy_from_slice(&msg[HEADER_LEN..HEADER_LEN + CHALLENGE_LEN]);
        crypto.encrypt_block(&self.config.key, &mut c);

        let mut b = [0u8; HEADER_LEN + CHALLENGE_LEN];
        b[0] = BOOTLOAD_VERSION;
        b[1] = MsgType::AuthResponse as u8;
        b[HEADER_LEN..].copy_from_slice(&c);
        debug!("sending auth response");
        t.send(Some(&dest), &b)?;

        self.deadline = Some(t.now() + self.config.recheck_delay_ms);
        self.set_state(State::DelayBeforeRecheck);
        Ok(())
    }

    fn xmodem_reply(
        &mut self,
        ty: u8,
        store: &mut impl ImageStore,
        t: &mut impl BootloadTransport,
    ) -> Result<()> {
        let State::SendingData(x) = &mut self.state else {
            debug!("unexpected bootload message 0x{ty:02x}");
            return Ok(());
        };
        match x.handle(ty) {
            XmodemStatus::Send => self.send_frame(store, t),
            XmodemStatus::Complete => {
                self.finish(true, t);
                Ok(())
            }
            XmodemStatus::Failed => {
                self.finish(false, t);
                Ok(())
            }
            XmodemStatus::Ignore => Ok(()),
        }
    }

    /// Handles timeouts
    pub fn progress(
        &mut self,
        store: &mut impl ImageStore,
        t: &mut impl BootloadTransport,
    ) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if t.now() < deadline {
            return;
        }
        self.deadline = None;

        let r = match &mut self.state {
            State::None => Ok(()),
            State::DelayBeforeRecheck => self.recheck(t),
            State::SendingData(x) => match x.timeout() {
                XmodemStatus::Send => self.send_frame(store, t),
                XmodemStatus::Failed => Err(OtaError::Transport),
                _ => Ok(()),
            },
            State::QuerySent
            | State::LaunchRequestSent
            | State::RecheckSent => {
                warn!("bootload timed out in state {:?}", self.state());
                Err(OtaError::Transport)
            }
        };
        if r.is_err() {
            self.finish(false, t);
        }
    }

    fn recheck(&mut self, t: &mut impl BootloadTransport) -> Result<()> {
        let dest = self.target_eui.ok_or(OtaError::InvalidCall)?;
        debug!("querying {dest} again");
        self.send_header_only(t, Some(&dest), MsgType::Query)?;
        self.deadline = Some(t.now() + self.config.query_timeout_ms);
        self.set_state(State::RecheckSent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EepromDriver, Progress, RamDevice, SimpleStore};
    use crate::verify::{Certificate, Digest, Signature};
    use crate::{build_image, OtaHeader, TAG_ECDSA_SIGNATURE};

    fn start_log() {
        let _ = env_logger::Builder::new()
            .filter(None, log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    }

    const TARGET: Eui64 = Eui64([0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80]);
    const OTHER: Eui64 = Eui64([9; 8]);
    const STORED: ImageId = ImageId::new(0x1002, 0x0030, 5);
    const KEY: [u8; 16] = [0xa5; 16];

    type Store = SimpleStore<EepromDriver<RamDevice<2048>>>;

    /// XORs with the key
    struct XorCrypto;

    impl Crypto for XorCrypto {
        type Hash = ();
        fn hash_init(&mut self) {}
        fn hash_update(&mut self, _hash: &mut (), _data: &[u8]) {}
        fn hash_final(&mut self, _hash: ()) -> Digest {
            [0; 16]
        }
        fn local_certificate(&mut self) -> Option<Certificate> {
            None
        }
        fn dsa_verify_start(
            &mut self,
            _digest: &Digest,
            _cert: &Certificate,
            _sig: &Signature,
        ) -> Result<()> {
            Err(OtaError::Verification)
        }
        fn dsa_verify_poll(&mut self) -> Option<bool> {
            Some(false)
        }
        fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]) {
            for (b, k) in block.iter_mut().zip(key) {
                *b ^= k;
            }
        }
    }

    #[derive(Default)]
    struct TestTransport {
        now: u64,
        sent: Vec<(Option<Eui64>, Vec<u8>)>,
        responses: Vec<(bool, TargetInfo)>,
        finished: Vec<bool>,
    }

    impl BootloadTransport for TestTransport {
        fn now(&mut self) -> u64 {
            self.now
        }
        fn send(&mut self, dest: Option<&Eui64>, msg: &[u8]) -> Result<()> {
            self.sent.push((dest.copied(), msg.to_vec()));
            Ok(())
        }
        fn query_response(&mut self, broadcast: bool, info: &TargetInfo) {
            self.responses.push((broadcast, *info));
        }
        fn finished(&mut self, success: bool) {
            self.finished.push(success);
        }
    }

    impl TestTransport {
        fn last(&self) -> &[u8] {
            &self.sent.last().unwrap().1
        }
    }

    fn store_with(payload: &[u8]) -> Store {
        start_log();
        let mut h = OtaHeader::new(&STORED, "bootload");
        let img = build_image(
            &mut h,
            &[(TAG_UPGRADE_IMAGE, payload), (TAG_ECDSA_SIGNATURE, &[7; 50])],
        )
        .unwrap();
        let mut s = SimpleStore::new(EepromDriver::new(RamDevice::new()));
        assert_eq!(s.clear_temp().unwrap(), Progress::Done);
        s.write_temp(0, &img).unwrap();
        s.finish_download(img.len() as u32).unwrap();
        s
    }

    fn query_response(active: bool) -> Vec<u8> {
        let mut m = vec![BOOTLOAD_VERSION, MsgType::QueryResponse as u8];
        m.push(active as u8);
        m.extend_from_slice(&0x1002u16.to_be_bytes());
        m.extend_from_slice(b"HARDWARE-TAG-001");
        m.extend_from_slice(&[0x01, 2, 3, 4]);
        m.extend_from_slice(&0x0105u16.to_be_bytes());
        m
    }

    fn challenge(version: u8) -> Vec<u8> {
        let mut m = vec![BOOTLOAD_VERSION, MsgType::AuthChallenge as u8];
        m.push(version);
        m.extend_from_slice(&0x0105u16.to_be_bytes());
        m.extend_from_slice(&[2, 3, 4]);
        m.extend_from_slice(&TARGET.0);
        m.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        m
    }

    fn reply(ty: MsgType) -> [u8; 2] {
        [BOOTLOAD_VERSION, ty as u8]
    }

    fn server() -> BootloadServer {
        BootloadServer::new(BootloadConfig {
            key: KEY,
            ..Default::default()
        })
    }

    #[test]
    fn full_flow() {
        let payload: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let mut store = store_with(&payload);
        let mut t = TestTransport::default();
        let mut c = XorCrypto;
        let mut s = server();

        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        assert_eq!(s.state(), BootloadState::QuerySent);
        assert_eq!(t.sent[0], (Some(TARGET), vec![1, 0x51]));
        assert_eq!(s.deadline(), Some(2000));

        s.receive(&TARGET, &query_response(false), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::LaunchRequestSent);
        assert_eq!(t.responses.len(), 1);
        assert!(!t.responses[0].0);
        let info = t.responses[0].1;
        assert_eq!(info.manufacturer_id, 0x1002);
        assert_eq!(info.bootloader_version, 0x0105);
        assert_eq!((info.platform, info.micro, info.phy), (2, 3, 4));
        let l = t.last();
        assert_eq!(&l[..4], &[1, 0x4c, 0x02, 0x10]);
        assert_eq!(&l[4..], b"HARDWARE-TAG-001");

        let ch = challenge(CHALLENGE_VERSION);
        s.receive(&TARGET, &ch, &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::DelayBeforeRecheck);
        let l = t.last().to_vec();
        assert_eq!(&l[..2], &[1, 0x72]);
        let expect: Vec<u8> = ch[2..18].iter().map(|b| b ^ 0xa5).collect();
        assert_eq!(&l[2..], &expect[..]);

        t.now = 2000;
        s.progress(&mut store, &mut t);
        assert_eq!(s.state(), BootloadState::RecheckSent);
        assert_eq!(t.last(), &[1, 0x51]);

        s.receive(&TARGET, &query_response(true), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::SendingData);
        let l = t.last();
        assert_eq!(l.len(), XMODEM_FRAME_LEN);
        assert_eq!(&l[..4], &[1, 0x01, 1, 0xfe]);
        assert_eq!(&l[4..68], &payload[..64]);

        s.receive(&TARGET, &reply(MsgType::Ack), &mut store, &mut c, &mut t);
        let l = t.last();
        assert_eq!(&l[..4], &[1, 0x01, 2, 0xfd]);
        assert_eq!(&l[4..40], &payload[64..]);
        assert!(l[40..68].iter().all(|b| *b == 0xff));

        s.receive(&TARGET, &reply(MsgType::BlockOk), &mut store, &mut c, &mut t);
        assert_eq!(t.last(), &[1, 0x04]);
        s.receive(&TARGET, &reply(MsgType::FileDone), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::None);
        assert_eq!(t.finished, [true]);
    }

    #[test]
    fn already_active() {
        let mut store = store_with(&[0x33; 10]);
        let mut t = TestTransport::default();
        let mut s = server();

        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        s.receive(&TARGET, &query_response(true), &mut store, &mut XorCrypto, &mut t);
        assert_eq!(s.state(), BootloadState::SendingData);
        assert_eq!(&t.last()[4..14], &[0x33; 10]);
    }

    #[test]
    fn timeouts() {
        let mut store = store_with(&[1; 10]);
        let mut t = TestTransport::default();
        let mut s = server();

        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        t.now = 1999;
        s.progress(&mut store, &mut t);
        assert_eq!(s.state(), BootloadState::QuerySent);
        t.now = 2000;
        s.progress(&mut store, &mut t);
        assert_eq!(s.state(), BootloadState::None);
        assert_eq!(t.finished, [false]);

        // launch request unanswered
        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        s.receive(&TARGET, &query_response(false), &mut store, &mut XorCrypto, &mut t);
        t.now = 4000;
        s.progress(&mut store, &mut t);
        assert_eq!(s.state(), BootloadState::None);
        assert_eq!(t.finished, [false, false]);
    }

    #[test]
    fn recheck_not_active() {
        let mut store = store_with(&[1; 10]);
        let mut t = TestTransport::default();
        let mut c = XorCrypto;
        let mut s = server();

        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        s.receive(&TARGET, &query_response(false), &mut store, &mut c, &mut t);
        s.receive(&TARGET, &challenge(1), &mut store, &mut c, &mut t);
        t.now = 2000;
        s.progress(&mut store, &mut t);
        s.receive(&TARGET, &query_response(false), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::None);
        assert_eq!(t.finished, [false]);
    }

    #[test]
    fn ignored_messages() {
        let mut store = store_with(&[1; 10]);
        let mut t = TestTransport::default();
        let mut c = XorCrypto;
        let mut s = server();

        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        s.receive(&OTHER, &query_response(true), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::QuerySent);

        let mut bad = query_response(true);
        bad[0] = 2;
        s.receive(&TARGET, &bad, &mut store, &mut c, &mut t);
        s.receive(&TARGET, &[1], &mut store, &mut c, &mut t);
        s.receive(&TARGET, &query_response(true)[..20], &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::QuerySent);
        assert_eq!(t.sent.len(), 1);

        s.receive(&TARGET, &query_response(false), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::LaunchRequestSent);
        let sent = t.sent.len();
        // wrong challenge version gets no reply
        s.receive(&TARGET, &challenge(2), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::LaunchRequestSent);
        s.receive(&TARGET, &challenge(1)[..10], &mut store, &mut c, &mut t);
        assert_eq!(t.sent.len(), sent);
    }

    #[test]
    fn start_checks() {
        let mut store = store_with(&[1; 10]);
        let mut t = TestTransport::default();
        let mut s = server();

        let missing = ImageId::new(0x1002, 0x0030, 6);
        assert_eq!(
            s.start(TARGET, &missing, &mut store, &mut t),
            Err(OtaError::NotFound)
        );
        assert_eq!(
            s.start(TARGET, &ImageId::INVALID, &mut store, &mut t),
            Err(OtaError::NotFound)
        );
        assert_eq!(
            s.start_with_current_target(&STORED, &mut store, &mut t),
            Err(OtaError::NotFound)
        );

        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        assert_eq!(
            s.start(TARGET, &STORED, &mut store, &mut t),
            Err(OtaError::InvalidCall)
        );
        assert_eq!(s.broadcast_query(&mut t), Err(OtaError::InvalidCall));
    }

    #[test]
    fn broadcast_then_start() {
        let mut store = store_with(&[1; 10]);
        let mut t = TestTransport::default();
        let mut s = server();

        s.broadcast_query(&mut t).unwrap();
        assert_eq!(t.sent[0], (None, vec![1, 0x51]));
        s.receive(&OTHER, &query_response(true), &mut store, &mut XorCrypto, &mut t);
        assert_eq!(s.state(), BootloadState::None);
        assert!(t.responses[0].0);
        assert_eq!(s.current_target().map(|i| i.eui64), Some(OTHER));

        s.start_with_current_target(&STORED, &mut store, &mut t).unwrap();
        assert_eq!(t.last(), &[1, 0x51]);
        assert_eq!(t.sent[1].0, Some(OTHER));
    }

    #[test]
    fn nak_exhaustion() {
        let mut store = store_with(&[1; 10]);
        let mut t = TestTransport::default();
        let mut c = XorCrypto;
        let mut s = server();

        s.start(TARGET, &STORED, &mut store, &mut t).unwrap();
        s.receive(&TARGET, &query_response(true), &mut store, &mut c, &mut t);
        let first = t.last().to_vec();
        for _ in 0..4 {
            s.receive(&TARGET, &reply(MsgType::Nak), &mut store, &mut c, &mut t);
            assert_eq!(t.last(), &first[..]);
        }
        // a timeout counts as a retry
        t.now = 10_000;
        s.progress(&mut store, &mut t);
        assert_eq!(t.last(), &first[..]);
        s.receive(&TARGET, &reply(MsgType::Nak), &mut store, &mut c, &mut t);
        assert_eq!(s.state(), BootloadState::None);
        assert_eq!(t.finished, [false]);
    }
}
