// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * OTA image signature verification.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Image signature verification
//!
//! An image carries a signing certificate tag and a signature tag. The
//! signer must be on a small allow-list and share an issuer with the
//! device's own certificate. The digest over the image is computed in
//! bounded steps so a caller can spread it across scheduler ticks.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::store::ImageStore;
use crate::{ImageRead, TAG_ECDSA_SIGNATURE, TAG_ECDSA_SIGNING_CERT};
use zigbee_ota::{Eui64, ImageId, OtaError, Result};

/// Size of the allow-list
pub const MAX_SIGNERS: usize = 3;
/// Certificate length
pub const CERTIFICATE_LEN: usize = 48;
/// Public key length, preceding the subject in a certificate
pub const PUBLIC_KEY_LEN: usize = 22;
/// Offset of the big-endian subject EUI64 in a certificate
pub const CERT_SUBJECT_OFFSET: usize = PUBLIC_KEY_LEN;
/// Offset of the big-endian issuer in a certificate
pub const CERT_ISSUER_OFFSET: usize = CERT_SUBJECT_OFFSET + 8;
/// Signature length
pub const SIGNATURE_LEN: usize = 42;
/// Signature tag data, signer EUI64 then signature
pub const SIGNATURE_TAG_LEN: usize = 8 + SIGNATURE_LEN;
/// Digest length, one cipher block
pub const DIGEST_LEN: usize = 16;
/// Bytes hashed per step
pub const HASH_BLOCK_SIZE: usize = 96;

/// Implicit certificate
pub type Certificate = [u8; CERTIFICATE_LEN];
/// Message digest
pub type Digest = [u8; DIGEST_LEN];
/// ECDSA signature
pub type Signature = [u8; SIGNATURE_LEN];

/// Cryptographic primitives supplied by the platform
pub trait Crypto {
    /// Incremental hash state
    type Hash;

    /// Starts a new hash
    fn hash_init(&mut self) -> Self::Hash;

    /// Adds data to a hash
    fn hash_update(&mut self, hash: &mut Self::Hash, data: &[u8]);

    /// Completes a hash
    fn hash_final(&mut self, hash: Self::Hash) -> Digest;

    /// The device's own certificate
    fn local_certificate(&mut self) -> Option<Certificate>;

    /// Starts an asynchronous signature check
    fn dsa_verify_start(
        &mut self,
        digest: &Digest,
        cert: &Certificate,
        signature: &Signature,
    ) -> Result<()>;

    /// Polls the signature check, `None` while pending
    fn dsa_verify_poll(&mut self) -> Option<bool>;

    /// Encrypts one block in place with a symmetric key
    fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]);
}

/// Outcome of a verification step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    /// Signature is valid
    Good,
    /// Image is signed incorrectly or by an unknown signer
    Bad,
    /// Digest incomplete, call again
    InProgress,
    /// Signature check pending, call again
    Wait,
    /// Image could not be checked
    Error,
}

enum Stage<H> {
    Hashing { hash: H, offset: u32 },
    Signing,
}

struct Context<H> {
    id: ImageId,
    stage: Stage<H>,
}

/// Resumable signature verification
pub struct Verifier<C: Crypto> {
    signers: [Eui64; MAX_SIGNERS],
    ctx: Option<Context<C::Hash>>,
}

impl<C: Crypto> Verifier<C> {
    /// Creates a verifier with an empty allow-list
    pub fn new() -> Self {
        Self {
            signers: [Eui64::NULL; MAX_SIGNERS],
            ctx: None,
        }
    }

    /// Adds an allowed signer
    pub fn add_signer(&mut self, eui: Eui64) -> Result<()> {
        if eui.is_null() {
            return Err(OtaError::InvalidCall);
        }
        let slot = self
            .signers
            .iter_mut()
            .find(|s| s.is_null())
            .ok_or(OtaError::Full)?;
        *slot = eui;
        Ok(())
    }

    /// Adds an allowed signer given big-endian, as in a certificate
    pub fn add_signer_be(&mut self, eui: &[u8; 8]) -> Result<()> {
        self.add_signer(Eui64(*eui).reversed())
    }

    fn signer_allowed(&self, subject: &Eui64) -> bool {
        !subject.is_null() && self.signers.iter().any(|s| s == subject)
    }

    /// Whether a verification is in progress
    pub fn active(&self) -> bool {
        self.ctx.is_some()
    }

    /// Discards any verification in progress
    pub fn abort(&mut self) {
        self.ctx = None;
    }

    /// Performs a verification step for image `id`
    ///
    /// At most `max_hash_calculations` digest blocks are processed per
    /// call, 0 for no limit. `new_verification` restarts from the
    /// beginning.
    pub fn verify<S: ImageStore>(
        &mut self,
        store: &mut S,
        crypto: &mut C,
        id: &ImageId,
        new_verification: bool,
        max_hash_calculations: u32,
    ) -> VerifyStatus {
        let s = self.verify_inner(
            store,
            crypto,
            id,
            new_verification,
            max_hash_calculations,
        );
        match s {
            VerifyStatus::InProgress | VerifyStatus::Wait => (),
            VerifyStatus::Good => {
                info!("image {id} signature good");
                self.ctx = None;
            }
            _ => {
                warn!("image {id} verification {s:?}");
                self.ctx = None;
            }
        }
        s
    }

    fn verify_inner<S: ImageStore>(
        &mut self,
        store: &mut S,
        crypto: &mut C,
        id: &ImageId,
        new_verification: bool,
        max_hash_calculations: u32,
    ) -> VerifyStatus {
        if new_verification {
            debug!("verifying signature of {id}");
            self.ctx = None;
        }

        if let Some(Context {
            stage: Stage::Signing,
            ..
        }) = self.ctx
        {
            return match crypto.dsa_verify_poll() {
                None => VerifyStatus::Wait,
                Some(true) => VerifyStatus::Good,
                Some(false) => VerifyStatus::Bad,
            };
        }

        let mut img = store.image(*id);

        let mut cert = [0u8; CERTIFICATE_LEN];
        match img.tag_data(TAG_ECDSA_SIGNING_CERT, &mut cert) {
            Ok(CERTIFICATE_LEN) => (),
            Ok(_) | Err(_) => {
                debug!("could not obtain signing certificate");
                return VerifyStatus::Error;
            }
        }

        let subject = match Eui64::from_be_slice(
            &cert[CERT_SUBJECT_OFFSET..CERT_SUBJECT_OFFSET + 8],
        ) {
            Some(s) => s,
            None => return VerifyStatus::Error,
        };
        if !self.signer_allowed(&subject) {
            debug!("certificate subject {subject} is not an allowed signer");
            return VerifyStatus::Bad;
        }

        let mut tag = [0u8; SIGNATURE_TAG_LEN];
        match img.tag_data(TAG_ECDSA_SIGNATURE, &mut tag) {
            Ok(SIGNATURE_TAG_LEN) => (),
            Ok(_) | Err(_) => {
                debug!("could not obtain signature");
                return VerifyStatus::Bad;
            }
        }
        if tag[..8] != subject.0 {
            debug!("certificate subject and signer do not match");
            return VerifyStatus::Bad;
        }

        if self.ctx.is_none() {
            let Some(local) = crypto.local_certificate() else {
                debug!("no local certificate");
                return VerifyStatus::Bad;
            };
            let issuer = CERT_ISSUER_OFFSET..CERT_ISSUER_OFFSET + 8;
            if local[issuer.clone()] != cert[issuer] {
                debug!("certificate issuer mismatch");
                return VerifyStatus::Bad;
            }
        }

        let size = match img.header() {
            Ok(h) => h.image_size,
            Err(_) => return VerifyStatus::Error,
        };
        let Some(end) = size.checked_sub(SIGNATURE_LEN as u32) else {
            return VerifyStatus::Error;
        };

        let ctx = self.ctx.get_or_insert_with(|| {
            trace!("starting digest of {end} bytes");
            Context {
                id: *id,
                stage: Stage::Hashing {
                    hash: crypto.hash_init(),
                    offset: 0,
                },
            }
        });
        if !ctx.id.same_triplet(id) {
            return VerifyStatus::Error;
        }
        let Stage::Hashing { hash, offset } = &mut ctx.stage else {
            return VerifyStatus::Error;
        };

        let mut block = [0u8; HASH_BLOCK_SIZE];
        let mut iterations = 0;
        while *offset < end {
            let l = ((end - *offset) as usize).min(HASH_BLOCK_SIZE);
            match img.read_exact_at(*offset, &mut block[..l]) {
                Ok(()) => (),
                Err(e) => {
                    error!("digest read failed: {e}");
                    return VerifyStatus::Error;
                }
            }
            crypto.hash_update(hash, &block[..l]);
            *offset += l as u32;
            iterations += 1;
            if *offset < end
                && max_hash_calculations != 0
                && iterations >= max_hash_calculations
            {
                return VerifyStatus::InProgress;
            }
        }

        let Stage::Hashing { hash, .. } =
            core::mem::replace(&mut ctx.stage, Stage::Signing)
        else {
            return VerifyStatus::Error;
        };
        let digest = crypto.hash_final(hash);
        trace!("digest {digest:02x?}");

        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&tag[8..]);
        match crypto.dsa_verify_start(&digest, &cert, &sig) {
            Ok(()) => VerifyStatus::Wait,
            Err(e) => {
                debug!("could not start signature check: {e}");
                VerifyStatus::Error
            }
        }
    }
}

impl<C: Crypto> Default for Verifier<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EepromDriver, RamDevice, SimpleStore};
    use crate::{build_image, OtaHeader, TAG_UPGRADE_IMAGE};
    use sha2::{Digest as _, Sha256};

    fn start_log() {
        let _ = env_logger::Builder::new()
            .filter(None, log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    }

    /// Signature is a keyed hash of digest and certificate
    #[derive(Default)]
    struct FakeCrypto {
        local: Option<Certificate>,
        pending: Option<bool>,
        polls_until_done: u32,
    }

    fn sign(digest: &Digest, cert: &Certificate) -> Signature {
        let h = Sha256::new()
            .chain_update(b"sig")
            .chain_update(digest)
            .chain_update(cert)
            .finalize();
        let mut s = [0u8; SIGNATURE_LEN];
        s[..32].copy_from_slice(&h);
        s
    }

    impl Crypto for FakeCrypto {
        type Hash = Sha256;
        fn hash_init(&mut self) -> Sha256 {
            Sha256::new()
        }
        fn hash_update(&mut self, hash: &mut Sha256, data: &[u8]) {
            hash.update(data)
        }
        fn hash_final(&mut self, hash: Sha256) -> Digest {
            let mut d = [0u8; DIGEST_LEN];
            d.copy_from_slice(&hash.finalize()[..DIGEST_LEN]);
            d
        }
        fn local_certificate(&mut self) -> Option<Certificate> {
            self.local
        }
        fn dsa_verify_start(
            &mut self,
            digest: &Digest,
            cert: &Certificate,
            signature: &Signature,
        ) -> Result<()> {
            self.pending = Some(sign(digest, cert) == *signature);
            self.polls_until_done = 1;
            Ok(())
        }
        fn dsa_verify_poll(&mut self) -> Option<bool> {
            if self.polls_until_done > 0 {
                self.polls_until_done -= 1;
                return None;
            }
            self.pending.take()
        }
        fn encrypt_block(&mut self, _key: &[u8; 16], _block: &mut [u8; 16]) {}
    }

    const SIGNER: [u8; 8] = [0x00, 0x0d, 0x6f, 0x00, 0x00, 0x00, 0x00, 0x01];
    const ISSUER: [u8; 8] = [0x54, 0x45, 0x53, 0x54, 0x53, 0x45, 0x43, 0x41];

    fn cert(subject: [u8; 8], issuer: [u8; 8]) -> Certificate {
        let mut c = [0x5au8; CERTIFICATE_LEN];
        c[CERT_SUBJECT_OFFSET..CERT_SUBJECT_OFFSET + 8].copy_from_slice(&subject);
        c[CERT_ISSUER_OFFSET..CERT_ISSUER_OFFSET + 8].copy_from_slice(&issuer);
        c
    }

    fn signed_image(signer: [u8; 8], payload_len: usize) -> Vec<u8> {
        let c = cert(signer, ISSUER);
        let mut h = OtaHeader::new(&ImageId::new(0x1002, 1, 2), "signed");
        let payload: Vec<u8> = (0..payload_len).map(|i| (i * 7) as u8).collect();
        let mut sigtag = [0u8; SIGNATURE_TAG_LEN];
        let mut le = signer;
        le.reverse();
        sigtag[..8].copy_from_slice(&le);
        let mut v = build_image(
            &mut h,
            &[
                (TAG_UPGRADE_IMAGE, &payload),
                (TAG_ECDSA_SIGNING_CERT, &c),
                (TAG_ECDSA_SIGNATURE, &sigtag),
            ],
        )
        .unwrap();
        let end = v.len() - SIGNATURE_LEN;
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(&Sha256::digest(&v[..end])[..DIGEST_LEN]);
        v[end..].copy_from_slice(&sign(&d, &c));
        v
    }

    type Store = SimpleStore<EepromDriver<RamDevice<4096>>>;

    fn store(img: &[u8]) -> (Store, ImageId) {
        let mut s = SimpleStore::new(EepromDriver::new(RamDevice::new()));
        s.clear_temp().unwrap();
        s.write_temp(0, img).unwrap();
        s.finish_download(img.len() as u32).unwrap();
        let id = s.first().unwrap();
        (s, id)
    }

    fn run(
        v: &mut Verifier<FakeCrypto>,
        s: &mut Store,
        c: &mut FakeCrypto,
        id: &ImageId,
        max: u32,
    ) -> (VerifyStatus, usize) {
        let mut st = v.verify(s, c, id, true, max);
        let mut calls = 1;
        while matches!(st, VerifyStatus::InProgress | VerifyStatus::Wait) {
            st = v.verify(s, c, id, false, max);
            calls += 1;
        }
        (st, calls)
    }

    fn crypto() -> FakeCrypto {
        FakeCrypto {
            local: Some(cert([9; 8], ISSUER)),
            ..Default::default()
        }
    }

    fn verifier() -> Verifier<FakeCrypto> {
        let mut v = Verifier::new();
        v.add_signer_be(&SIGNER).unwrap();
        v
    }

    #[test]
    fn good() {
        start_log();
        let img = signed_image(SIGNER, 1000);
        let (mut s, id) = store(&img);
        let mut v = verifier();
        let mut c = crypto();

        let (st, calls) = run(&mut v, &mut s, &mut c, &id, 0);
        assert_eq!(st, VerifyStatus::Good);
        // digest, one pending poll, result
        assert_eq!(calls, 3);
        assert!(!v.active());

        // 1130 bytes hashed is 12 blocks, so two digest calls
        let (st, calls) = run(&mut v, &mut s, &mut c, &id, 10);
        assert_eq!(st, VerifyStatus::Good);
        assert_eq!(calls, 4);
    }

    #[test]
    fn throttled_digest_matches() {
        let img = signed_image(SIGNER, 777);
        let (mut s, id) = store(&img);
        for max in [0, 1, 2, 5, 13] {
            let mut v = verifier();
            let mut c = crypto();
            assert_eq!(run(&mut v, &mut s, &mut c, &id, max).0, VerifyStatus::Good);
        }
    }

    #[test]
    fn rejections() {
        start_log();
        let mut c = crypto();

        // unknown signer
        let other = [0x00, 0x0d, 0x6f, 0, 0, 0, 0, 2];
        let (mut s, id) = store(&signed_image(other, 100));
        let mut v = verifier();
        assert_eq!(v.verify(&mut s, &mut c, &id, true, 0), VerifyStatus::Bad);

        // tampered payload
        let mut img = signed_image(SIGNER, 100);
        img[70] ^= 1;
        let (mut s, id) = store(&img);
        assert_eq!(run(&mut v, &mut s, &mut c, &id, 0).0, VerifyStatus::Bad);

        // issuer mismatch
        let (mut s, id) = store(&signed_image(SIGNER, 100));
        let mut c2 = FakeCrypto {
            local: Some(cert([9; 8], [1; 8])),
            ..Default::default()
        };
        assert_eq!(v.verify(&mut s, &mut c2, &id, true, 0), VerifyStatus::Bad);
        let mut c3 = FakeCrypto::default();
        assert_eq!(v.verify(&mut s, &mut c3, &id, true, 0), VerifyStatus::Bad);

        // null subject never matches
        let (mut s, id) = store(&signed_image([0; 8], 100));
        assert_eq!(v.verify(&mut s, &mut c, &id, true, 0), VerifyStatus::Bad);
        assert!(v.add_signer(Eui64::NULL).is_err());
    }

    #[test]
    fn missing_tags() {
        start_log();
        let mut v = verifier();
        let mut c = crypto();

        let mut h = OtaHeader::new(&ImageId::new(0x1002, 1, 2), "unsigned");
        let img = build_image(&mut h, &[(TAG_UPGRADE_IMAGE, &[1u8; 200])]).unwrap();
        let (mut s, id) = store(&img);
        assert_eq!(v.verify(&mut s, &mut c, &id, true, 0), VerifyStatus::Error);

        let c1 = cert(SIGNER, ISSUER);
        let img = build_image(
            &mut h,
            &[(TAG_UPGRADE_IMAGE, &[1u8; 200]), (TAG_ECDSA_SIGNING_CERT, &c1)],
        )
        .unwrap();
        let (mut s, id) = store(&img);
        assert_eq!(v.verify(&mut s, &mut c, &id, true, 0), VerifyStatus::Bad);

        // image not stored
        let missing = ImageId::new(0x1002, 1, 3);
        assert_eq!(v.verify(&mut s, &mut c, &missing, true, 0), VerifyStatus::Error);
    }

    #[test]
    fn signer_list() {
        let mut v = Verifier::<FakeCrypto>::new();
        for i in 1..=MAX_SIGNERS as u8 {
            v.add_signer(Eui64([i; 8])).unwrap();
        }
        assert_eq!(v.add_signer(Eui64([7; 8])), Err(OtaError::Full));
        assert!(v.signer_allowed(&Eui64([2; 8])));
        assert!(!v.signer_allowed(&Eui64::NULL));
    }
}
