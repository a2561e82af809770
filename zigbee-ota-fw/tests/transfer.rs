// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Client and server exchanging an image over a loopback link.
 *
 * Copyright (c) 2024 Code Construct
 */

#[allow(unused)]
use log::{debug, error, info, trace, warn};

mod common;
use common::*;

use zigbee_ota::proto::Cmd;
use zigbee_ota::Eui64;
use zigbee_ota_fw::client::{Client, ClientConfig, ClientState, DownloadResult};
use zigbee_ota_fw::server::{ServerConfig, UpgradePolicy};
use zigbee_ota_fw::store::{
    EepromDriver, ImageStore, RamDevice, SimpleStore, StorageDriver,
};
use zigbee_ota_fw::verify::VerifyStatus;

fn block_config() -> (ClientConfig, ServerConfig) {
    let c = ClientConfig {
        max_data_size: 40,
        ..Default::default()
    };
    let s = ServerConfig {
        max_block_size: 40,
        ..Default::default()
    };
    (c, s)
}

fn stored_image(s: &mut Store) -> Vec<u8> {
    let id = s.first().unwrap();
    let len = s.total_size(&id).unwrap();
    let mut b = vec![0u8; len as usize];
    assert_eq!(s.read(&id, 0, &mut b).unwrap(), b.len());
    b
}

/// Checks the saved download offset covers only bytes matching `img`
fn check_saved_prefix(s: &mut Store, img: &[u8]) -> u32 {
    let st = s.check_temp();
    let mut b = vec![0u8; st.offset as usize];
    s.driver().read(0, &mut b).unwrap();
    assert_eq!(b, img[..b.len()], "saved offset {} covers a gap", st.offset);
    st.offset
}

/// Block request offsets sent by the client
fn block_offsets(h: &Loopback) -> Vec<u32> {
    h.sent
        .iter()
        .filter(|f| f.cluster_specific && f.cmd == Cmd::ImageBlockRequest as u8)
        .map(|f| {
            u32::from_le_bytes([
                f.payload[9],
                f.payload[10],
                f.payload[11],
                f.payload[12],
            ])
        })
        .collect()
}

#[test]
fn block_download_and_upgrade() {
    let img = signed_image(&NEW, &payload(228), &SIGNER);
    assert_eq!(img.len(), 400);
    let (c, s) = block_config();
    let mut h = Loopback::new(c, s, &img);
    h.start();

    assert!(h.run_until(60_000, 10, |h| !h.dev.bootloaded.is_empty()));

    assert_eq!(h.sent_count(Cmd::ImageBlockRequest as u8), 10);
    assert_eq!(
        block_offsets(&h),
        (0..10).map(|i| i * 40).collect::<Vec<u32>>()
    );
    assert_eq!(h.dev.verify, [VerifyStatus::Good]);
    assert_eq!(h.dev.results, [DownloadResult::Success]);
    assert_eq!(h.dev.bootloaded, [NEW]);
    assert_eq!(h.sent_count(Cmd::UpgradeEndRequest as u8), 1);
    assert_eq!(*h.dev.progress.last().unwrap(), 400);
    assert_eq!(stored_image(&mut h.client_store), img);

    // running the new image, nothing further to fetch
    let downloading = |h: &Loopback| h.client.state() == ClientState::Download;
    assert!(!h.run_until(10_000, 100, downloading));
}

#[test]
fn page_download() {
    let img = signed_image(&NEW, &payload(1000), &SIGNER);
    let (mut c, s) = block_config();
    c.use_page_request = true;
    c.page_request_size = 128;
    let mut h = Loopback::new(c, s, &img);
    h.start();

    assert!(h.run_until(60_000, 5, |h| !h.dev.bootloaded.is_empty()));
    let pages = img.len().div_ceil(128);
    assert_eq!(h.sent_count(Cmd::ImagePageRequest as u8), pages);
    assert_eq!(h.sent_count(Cmd::ImageBlockRequest as u8), 0);
    assert_eq!(h.dev.results, [DownloadResult::Success]);
    assert_eq!(stored_image(&mut h.client_store), img);
}

#[test]
fn page_download_with_losses() {
    let img = signed_image(&NEW, &payload(600), &SIGNER);
    let (mut c, mut s) = block_config();
    c.use_page_request = true;
    c.page_request_size = 256;
    c.page_request_timeout_ms = 500;
    s.page_miss_modulus = Some(3);
    let mut h = Loopback::new(c, s, &img);
    h.start();

    assert!(h.run_until(120_000, 5, |h| !h.dev.bootloaded.is_empty()));
    // missed blocks are fetched individually
    assert!(h.sent_count(Cmd::ImageBlockRequest as u8) > 0);
    assert_eq!(h.dev.results, [DownloadResult::Success]);
    assert_eq!(stored_image(&mut h.client_store), img);
}

#[test]
fn unknown_signer() {
    let other = Eui64([0x42; 8]);
    let img = signed_image(&NEW, &payload(228), &other);
    let (c, s) = block_config();
    let mut h = Loopback::new(c, s, &img);
    h.start();

    assert!(h.run_until(60_000, 10, |h| !h.dev.results.is_empty()));
    assert_eq!(h.dev.verify, [VerifyStatus::Bad]);
    assert_eq!(h.dev.results, [DownloadResult::VerifyFailed]);
    assert!(h.dev.bootloaded.is_empty());
    assert_eq!(h.client_store.first(), None);
    assert_eq!(h.client.state(), ClientState::QueryNextImage);
    h.step();
    assert_eq!(h.sent_count(Cmd::UpgradeEndRequest as u8), 1);
}

#[test]
fn tampered_image() {
    let mut img = signed_image(&NEW, &payload(228), &SIGNER);
    // inside the upgrade image tag
    img[100] ^= 0x01;
    let (c, s) = block_config();
    let mut h = Loopback::new(c, s, &img);
    h.start();

    assert!(h.run_until(60_000, 10, |h| !h.dev.results.is_empty()));
    assert_eq!(h.dev.verify, [VerifyStatus::Bad]);
    assert_eq!(h.dev.results, [DownloadResult::VerifyFailed]);
}

#[test]
fn resume_after_restart() {
    let img = signed_image(&NEW, &payload(228), &SIGNER);
    let (c, s) = block_config();
    let mut h = Loopback::new(c.clone(), s, &img);
    h.client_store =
        SimpleStore::new(EepromDriver::with_save_rate(RamDevice::new(), 40));
    h.start();

    assert!(h.run_until(10_000, 10, |h| h.client.offset() >= 200));
    assert_eq!(h.client.offset(), 200);

    // power cycle the client, keeping its storage
    h.client = Client::new(c).unwrap();
    h.client.verifier().add_signer(SIGNER).unwrap();
    h.dev.outbox.clear();
    let before = block_offsets(&h).len();
    h.start();

    assert!(h.run_until(60_000, 10, |h| !h.dev.bootloaded.is_empty()));
    let offsets = block_offsets(&h);
    assert_eq!(offsets[before], 200);
    assert_eq!(offsets.len(), 10);
    assert_eq!(stored_image(&mut h.client_store), img);
}

#[test]
fn page_resume_after_restart() {
    let img = signed_image(&NEW, &payload(2600), &SIGNER);
    let (mut c, mut s) = block_config();
    c.use_page_request = true;
    c.page_request_size = 1024;
    c.page_request_timeout_ms = 500;
    s.page_miss_modulus = Some(3);
    let mut h = Loopback::new(c.clone(), s, &img);
    h.client_store =
        SimpleStore::new(EepromDriver::with_save_rate(RamDevice::new(), 100));
    h.start();

    // stop partway through the second page, with blocks missing
    let mut steps = 0;
    while h.sent_count(Cmd::ImagePageRequest as u8) < 2 || steps < 40 {
        if h.sent_count(Cmd::ImagePageRequest as u8) >= 2 {
            steps += 1;
        }
        h.step();
        check_saved_prefix(&mut h.client_store, &img);
        h.dev.now += 5;
        h.net.now = h.dev.now;
        assert!(h.now() < 60_000);
    }
    let saved = check_saved_prefix(&mut h.client_store, &img);
    assert!(saved < 2048);

    // power cycle the client, keeping its storage
    h.client = Client::new(c).unwrap();
    h.client.verifier().add_signer(SIGNER).unwrap();
    h.dev.outbox.clear();
    h.start();

    while h.dev.bootloaded.is_empty() {
        h.step();
        check_saved_prefix(&mut h.client_store, &img);
        h.dev.now += 5;
        h.net.now = h.dev.now;
        assert!(h.now() < 300_000);
    }
    assert_eq!(h.dev.verify, [VerifyStatus::Good]);
    assert_eq!(h.dev.results, [DownloadResult::Success]);
    assert_eq!(stored_image(&mut h.client_store), img);
}

#[test]
fn server_defers_upgrade() {
    let img = signed_image(&NEW, &payload(228), &SIGNER);
    let (c, mut s) = block_config();
    s.upgrade_policy = UpgradePolicy::AskLater;
    let mut h = Loopback::new(c, s, &img);
    h.start();

    assert!(h.run_until(60_000, 10, |h| !h.dev.results.is_empty()));
    assert_eq!(h.dev.results, [DownloadResult::Success]);
    assert!(!h.run_until(30_000, 100, |h| !h.dev.bootloaded.is_empty()));
    assert_eq!(h.client.state(), ClientState::WaitForUpgrade);

    h.server.config_mut().upgrade_policy = UpgradePolicy::Now;
    // the client asks again an hour later
    let done = |h: &Loopback| !h.dev.bootloaded.is_empty();
    assert!(h.run_until(2 * 60 * 60 * 1000, 1000, done));
    assert_eq!(h.dev.bootloaded, [NEW]);
}

#[test]
fn lost_responses_fail_download() {
    let img = signed_image(&NEW, &payload(228), &SIGNER);
    let (c, s) = block_config();
    let mut h = Loopback::new(c, s, &img);
    h.drop_server =
        Some(Box::new(|f: &Frame| f.cmd == Cmd::ImageBlockResponse as u8));
    h.start();

    assert!(h.run_until(10 * 60 * 1000, 100, |h| !h.dev.results.is_empty()));
    assert_eq!(h.dev.results, [DownloadResult::ClientAborted]);
    assert_eq!(h.client.download_id(), None);
    // threshold of 10 consecutive failures
    assert_eq!(h.sent_count(Cmd::ImageBlockRequest as u8), 10);
}
