// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Shared test doubles: loopback network, sha2 crypto, signed images.
 *
 * Copyright (c) 2024 Code Construct
 */
#![allow(dead_code)]

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use sha2::{Digest as _, Sha256};

use zigbee_ota::proto::Message;
use zigbee_ota::{Eui64, ImageId, NodeId, Result};
use zigbee_ota_fw::client::{Client, ClientConfig, Device, DownloadResult};
use zigbee_ota_fw::server::{Server, ServerConfig, Transport};
use zigbee_ota_fw::store::{
    EepromDriver, ImageStore, Progress, RamDevice, SimpleStore,
};
use zigbee_ota_fw::verify::{
    Certificate, Crypto, Digest, Signature, VerifyStatus, CERTIFICATE_LEN,
    CERT_ISSUER_OFFSET, CERT_SUBJECT_OFFSET, DIGEST_LEN, SIGNATURE_LEN,
    SIGNATURE_TAG_LEN,
};
use zigbee_ota_fw::{
    build_image, OtaHeader, TAG_ECDSA_SIGNATURE, TAG_ECDSA_SIGNING_CERT,
    TAG_UPGRADE_IMAGE,
};

pub const SERVER_NODE: NodeId = 0x0000;
pub const CLIENT_NODE: NodeId = 0x4f21;
pub const SERVER_EUI: Eui64 = Eui64([0x11, 0x22, 0x33, 0x44, 0, 0, 0, 1]);
pub const SIGNER: Eui64 = Eui64([0x5a, 0x5a, 0x01, 0x02, 0x03, 0x04, 0, 0]);
pub const LOCAL_EUI: Eui64 = Eui64([0x77; 8]);
pub const ISSUER: [u8; 8] = *b"TESTCA01";

pub const RUNNING: ImageId = ImageId::new(0x1002, 0x0030, 0x0100);
pub const NEW: ImageId = ImageId::new(0x1002, 0x0030, 0x0200);

pub type Store = SimpleStore<EepromDriver<RamDevice<4096>>>;

pub fn start_log() {
    let _ = env_logger::Builder::new()
        .filter(None, log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

pub fn empty_store() -> Store {
    SimpleStore::new(EepromDriver::new(RamDevice::new()))
}

/// A store holding `img`
pub fn store_with(img: &[u8]) -> Store {
    let mut s = empty_store();
    assert_eq!(s.clear_temp().unwrap(), Progress::Done);
    s.write_temp(0, img).unwrap();
    s.finish_download(img.len() as u32).unwrap();
    s
}

/// A certificate with big-endian subject and issuer
pub fn certificate(subject: &Eui64, issuer: &[u8; 8]) -> Certificate {
    let mut c = [0u8; CERTIFICATE_LEN];
    c[0] = 0x02;
    c[CERT_SUBJECT_OFFSET..CERT_SUBJECT_OFFSET + 8]
        .copy_from_slice(&subject.reversed().0);
    c[CERT_ISSUER_OFFSET..CERT_ISSUER_OFFSET + 8].copy_from_slice(issuer);
    c
}

/// Builds an image signed by `signer`
///
/// The fake signature is the truncated SHA-256 of the image up to the
/// signature, followed by the signer's certificate subject.
pub fn signed_image(id: &ImageId, payload: &[u8], signer: &Eui64) -> Vec<u8> {
    let cert = certificate(signer, &ISSUER);
    let mut sig_tag = [0u8; SIGNATURE_TAG_LEN];
    sig_tag[..8].copy_from_slice(&signer.0);

    let mut h = OtaHeader::new(id, "signed test image");
    let mut img = build_image(
        &mut h,
        &[
            (TAG_UPGRADE_IMAGE, payload),
            (TAG_ECDSA_SIGNING_CERT, &cert),
            (TAG_ECDSA_SIGNATURE, &sig_tag),
        ],
    )
    .unwrap();

    let end = img.len() - SIGNATURE_LEN;
    let d = Sha256::digest(&img[..end]);
    img[end..end + DIGEST_LEN].copy_from_slice(&d[..DIGEST_LEN]);
    img[end + DIGEST_LEN..end + DIGEST_LEN + 8]
        .copy_from_slice(&cert[CERT_SUBJECT_OFFSET..CERT_SUBJECT_OFFSET + 8]);
    img
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 1) as u8).collect()
}

/// SHA-256 based stand-in for the platform crypto
pub struct ShaCrypto {
    local: Certificate,
    pending: Option<bool>,
    /// Polls reporting the signature check as pending
    pub verify_delay: u32,
    delay: u32,
}

impl ShaCrypto {
    pub fn new() -> Self {
        Self {
            local: certificate(&LOCAL_EUI, &ISSUER),
            pending: None,
            verify_delay: 2,
            delay: 0,
        }
    }
}

impl Crypto for ShaCrypto {
    type Hash = Sha256;

    fn hash_init(&mut self) -> Sha256 {
        Sha256::new()
    }

    fn hash_update(&mut self, hash: &mut Sha256, data: &[u8]) {
        hash.update(data);
    }

    fn hash_final(&mut self, hash: Sha256) -> Digest {
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(&hash.finalize()[..DIGEST_LEN]);
        d
    }

    fn local_certificate(&mut self) -> Option<Certificate> {
        Some(self.local)
    }

    fn dsa_verify_start(
        &mut self,
        digest: &Digest,
        cert: &Certificate,
        signature: &Signature,
    ) -> Result<()> {
        let subject = &cert[CERT_SUBJECT_OFFSET..CERT_SUBJECT_OFFSET + 8];
        let good = signature[..DIGEST_LEN] == digest[..]
            && signature[DIGEST_LEN..DIGEST_LEN + 8] == *subject;
        self.pending = Some(good);
        self.delay = self.verify_delay;
        Ok(())
    }

    fn dsa_verify_poll(&mut self) -> Option<bool> {
        if self.delay > 0 {
            self.delay -= 1;
            return None;
        }
        self.pending.take()
    }

    fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]) {
        for (b, k) in block.iter_mut().zip(key) {
            *b ^= k;
        }
    }
}

/// An encoded OTA cluster frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub src: NodeId,
    pub dest: NodeId,
    pub cluster_specific: bool,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    fn encode(src: NodeId, dest: NodeId, msg: &Message) -> Self {
        let mut b = [0u8; 128];
        let l = msg.write_buf(&mut b).unwrap();
        Self {
            src,
            dest,
            cluster_specific: msg.cluster_specific(),
            cmd: msg.cmd_id(),
            payload: b[..l].to_vec(),
        }
    }
}

/// Client side platform
pub struct ClientDev {
    pub now: u64,
    pub current: ImageId,
    pub outbox: Vec<Frame>,
    pub crypto: ShaCrypto,
    pub results: Vec<DownloadResult>,
    pub verify: Vec<VerifyStatus>,
    pub bootloaded: Vec<ImageId>,
    pub progress: Vec<u32>,
}

impl Device for ClientDev {
    type Crypto = ShaCrypto;

    fn now(&mut self) -> u64 {
        self.now
    }

    fn random(&mut self) -> u8 {
        0
    }

    fn send(&mut self, dest: NodeId, msg: &Message) -> Result<()> {
        self.outbox.push(Frame::encode(CLIENT_NODE, dest, msg));
        Ok(())
    }

    fn current_image(&mut self) -> ImageId {
        self.current
    }

    fn crypto(&mut self) -> &mut ShaCrypto {
        &mut self.crypto
    }

    fn download_progress(&mut self, offset: u32, _total: u32) {
        self.progress.push(offset);
    }

    fn verify_result(&mut self, _id: &ImageId, status: VerifyStatus) {
        self.verify.push(status);
    }

    fn download_complete(&mut self, result: DownloadResult, _id: &ImageId) -> bool {
        self.results.push(result);
        true
    }

    fn bootload(&mut self, id: &ImageId) {
        self.bootloaded.push(*id);
        self.current = *id;
    }
}

/// Server side transport
pub struct ServerNet {
    pub now: u64,
    pub max_payload: usize,
    pub outbox: Vec<Frame>,
}

impl Transport for ServerNet {
    fn now(&mut self) -> u64 {
        self.now
    }

    fn send(&mut self, dest: NodeId, msg: &Message) -> Result<()> {
        self.outbox.push(Frame::encode(SERVER_NODE, dest, msg));
        Ok(())
    }

    fn max_payload(&mut self, _dest: NodeId) -> usize {
        self.max_payload
    }
}

/// A client and server joined by a lossless link
pub struct Loopback {
    pub client: Client<ShaCrypto>,
    pub dev: ClientDev,
    pub client_store: Store,
    pub server: Server,
    pub net: ServerNet,
    pub server_store: Store,
    /// Every frame sent by the client
    pub sent: Vec<Frame>,
    /// Drops server frames when it returns `true`
    pub drop_server: Option<Box<dyn FnMut(&Frame) -> bool>>,
}

impl Loopback {
    pub fn new(
        client: ClientConfig,
        server: ServerConfig,
        image: &[u8],
    ) -> Self {
        start_log();
        let mut c = Client::new(client).unwrap();
        c.verifier().add_signer(SIGNER).unwrap();
        Self {
            client: c,
            dev: ClientDev {
                now: 0,
                current: RUNNING,
                outbox: Vec::new(),
                crypto: ShaCrypto::new(),
                results: Vec::new(),
                verify: Vec::new(),
                bootloaded: Vec::new(),
                progress: Vec::new(),
            },
            client_store: empty_store(),
            server: Server::new(server),
            net: ServerNet {
                now: 0,
                max_payload: 82,
                outbox: Vec::new(),
            },
            server_store: store_with(image),
            sent: Vec::new(),
            drop_server: None,
        }
    }

    /// Starts the client with the server already discovered
    pub fn start(&mut self) {
        self.client.start(&mut self.dev).unwrap();
        self.client.server_found(
            SERVER_NODE,
            SERVER_EUI,
            &mut self.dev,
            &mut self.client_store,
        );
    }

    pub fn now(&self) -> u64 {
        self.dev.now
    }

    /// Runs timers and delivers queued frames
    pub fn step(&mut self) {
        self.client.progress(&mut self.dev, &mut self.client_store);
        self.server.progress(&mut self.server_store, &mut self.net);

        for f in core::mem::take(&mut self.dev.outbox) {
            trace!("client -> server cmd 0x{:02x}", f.cmd);
            let _ = self.server.receive(
                f.src,
                f.cluster_specific,
                f.cmd,
                &f.payload,
                &mut self.server_store,
                &mut self.net,
            );
            self.sent.push(f);
        }

        for f in core::mem::take(&mut self.net.outbox) {
            if let Some(lose) = self.drop_server.as_mut() {
                if lose(&f) {
                    trace!("dropping server cmd 0x{:02x}", f.cmd);
                    continue;
                }
            }
            let _ = self.client.receive(
                f.src,
                false,
                f.cluster_specific,
                f.cmd,
                &f.payload,
                &mut self.dev,
                &mut self.client_store,
            );
        }
    }

    /// Steps every `step_ms` until `done` or `limit_ms` elapses
    pub fn run_until(
        &mut self,
        limit_ms: u64,
        step_ms: u64,
        done: impl Fn(&Self) -> bool,
    ) -> bool {
        let end = self.now() + limit_ms;
        while self.now() < end {
            self.step();
            if done(self) {
                return true;
            }
            self.dev.now += step_ms;
            self.net.now = self.dev.now;
        }
        false
    }

    /// Client frames of command `cmd`
    pub fn sent_count(&self, cmd: u8) -> usize {
        self.sent
            .iter()
            .filter(|f| f.cluster_specific && f.cmd == cmd)
            .count()
    }
}
