// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * XMODEM style block sender for the standalone bootloader.
 *
 * Copyright (c) 2024 Code Construct
 */

//! XMODEM sender
//!
//! Frames are prefixed by the bootload protocol version. Data frames carry
//! 64 bytes, padded with 0xFF, and a big-endian CRC-16/XMODEM.

#[allow(unused)]
use log::{debug, trace, warn};

use crc::Crc;
use num_derive::FromPrimitive;

use crate::ImageRead;
use zigbee_ota::{NoneNoSpace, OtaError, Result, SliceWriter};

/// Data bytes per frame
pub const XMODEM_BLOCK_SIZE: usize = 64;
/// Length of a data frame
pub const XMODEM_FRAME_LEN: usize = 4 + XMODEM_BLOCK_SIZE + 2;

const CRC_XMODEM: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Bootload message types
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum MsgType {
    Soh = 0x01,
    Eot = 0x04,
    Ack = 0x06,
    Nak = 0x15,
    Cancel = 0x18,
    BlockOk = 0x19,
    FileDone = 0x1A,
    LaunchRequest = 0x4C,
    Query = 0x51,
    QueryResponse = 0x52,
    AuthChallenge = 0x63,
    AuthResponse = 0x72,
}

/// What the caller should do after a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemStatus {
    /// Send the current frame
    Send,
    /// Nothing to send
    Ignore,
    /// Transfer acknowledged
    Complete,
    /// Transfer cancelled or out of retries
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Data,
    Eot,
    Done,
}

/// Sends `size` bytes as a sequence of acknowledged frames
#[derive(Debug)]
pub struct XmodemSender {
    version: u8,
    size: u32,
    offset: u32,
    block: u8,
    retries: u8,
    max_retries: u8,
    stage: Stage,
}

impl XmodemSender {
    pub fn new(version: u8, size: u32, max_retries: u8) -> Self {
        let stage = if size == 0 { Stage::Eot } else { Stage::Data };
        Self {
            version,
            size,
            offset: 0,
            block: 1,
            retries: 0,
            max_retries,
            stage,
        }
    }

    /// Offset of the current frame's data
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Current block number
    pub fn block(&self) -> u8 {
        self.block
    }

    /// Writes the current frame to `out`, reading data from `src`
    pub fn write_frame(
        &self,
        src: &mut impl ImageRead,
        out: &mut [u8],
    ) -> Result<usize> {
        let mut w = SliceWriter::new(out);
        match self.stage {
            Stage::Data => {
                let mut data = [0xffu8; XMODEM_BLOCK_SIZE];
                let l = (self.size - self.offset).min(XMODEM_BLOCK_SIZE as u32);
                src.read_exact_at(self.offset, &mut data[..l as usize])?;
                let crc = CRC_XMODEM.checksum(&data);
                trace!("xmodem block {} at {}", self.block, self.offset);

                w.push_le8(self.version).space()?;
                w.push_le8(MsgType::Soh as u8).space()?;
                w.push_le8(self.block).space()?;
                w.push_le8(!self.block).space()?;
                w.push(&data).space()?;
                w.push_be16(crc).space()?;
            }
            Stage::Eot => {
                w.push_le8(self.version).space()?;
                w.push_le8(MsgType::Eot as u8).space()?;
            }
            Stage::Done => return Err(OtaError::InvalidCall),
        }
        Ok(w.written())
    }

    fn retry(&mut self) -> XmodemStatus {
        if self.retries >= self.max_retries {
            warn!("xmodem out of retries at block {}", self.block);
            self.stage = Stage::Done;
            return XmodemStatus::Failed;
        }
        self.retries += 1;
        debug!("xmodem retry {} of block {}", self.retries, self.block);
        XmodemStatus::Send
    }

    /// No reply arrived in time
    pub fn timeout(&mut self) -> XmodemStatus {
        match self.stage {
            Stage::Done => XmodemStatus::Ignore,
            _ => self.retry(),
        }
    }

    /// Handles a reply of message type `reply`
    pub fn handle(&mut self, reply: u8) -> XmodemStatus {
        let Some(reply) = num_traits::FromPrimitive::from_u8(reply) else {
            debug!("unknown xmodem reply 0x{reply:02x}");
            return XmodemStatus::Ignore;
        };

        match (self.stage, reply) {
            (Stage::Done, _) => XmodemStatus::Ignore,
            (_, MsgType::Cancel) => {
                warn!("xmodem transfer cancelled");
                self.stage = Stage::Done;
                XmodemStatus::Failed
            }
            (_, MsgType::Nak) => self.retry(),
            (Stage::Data, MsgType::Ack | MsgType::BlockOk) => {
                self.retries = 0;
                self.offset = self
                    .offset
                    .saturating_add(XMODEM_BLOCK_SIZE as u32)
                    .min(self.size);
                self.block = self.block.wrapping_add(1);
                if self.offset >= self.size {
                    self.stage = Stage::Eot;
                }
                XmodemStatus::Send
            }
            (Stage::Eot, MsgType::Ack | MsgType::FileDone) => {
                self.stage = Stage::Done;
                XmodemStatus::Complete
            }
            (_, r) => {
                debug!("unexpected xmodem reply {r:?}");
                XmodemStatus::Ignore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &XmodemSender, src: &[u8]) -> Vec<u8> {
        let mut b = [0u8; XMODEM_FRAME_LEN];
        let l = s.write_frame(&mut &src[..], &mut b).unwrap();
        b[..l].to_vec()
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(CRC_XMODEM.checksum(b"123456789"), 0x31C3);
    }

    #[test]
    fn transfer() {
        let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let mut s = XmodemSender::new(1, data.len() as u32, 5);

        let f = frame(&s, &data);
        assert_eq!(f.len(), XMODEM_FRAME_LEN);
        assert_eq!(&f[..4], &[1, 0x01, 1, 0xfe]);
        assert_eq!(&f[4..68], &data[..64]);
        let crc = CRC_XMODEM.checksum(&data[..64]);
        assert_eq!(&f[68..], &crc.to_be_bytes());

        assert_eq!(s.handle(MsgType::BlockOk as u8), XmodemStatus::Send);
        assert_eq!(s.handle(MsgType::Ack as u8), XmodemStatus::Send);
        let f = frame(&s, &data);
        assert_eq!(&f[..4], &[1, 0x01, 3, 0xfc]);
        assert_eq!(&f[4..26], &data[128..]);
        assert!(f[26..68].iter().all(|b| *b == 0xff));

        assert_eq!(s.handle(MsgType::Ack as u8), XmodemStatus::Send);
        assert_eq!(frame(&s, &data), [1, 0x04]);
        assert_eq!(s.handle(MsgType::FileDone as u8), XmodemStatus::Complete);
        assert_eq!(s.handle(MsgType::Ack as u8), XmodemStatus::Ignore);
    }

    #[test]
    fn retries() {
        let data = [0x55u8; 64];
        let mut s = XmodemSender::new(1, 64, 2);
        assert_eq!(s.handle(MsgType::Nak as u8), XmodemStatus::Send);
        assert_eq!(s.timeout(), XmodemStatus::Send);
        assert_eq!(s.block(), 1);
        assert_eq!(s.handle(MsgType::Nak as u8), XmodemStatus::Failed);
        assert!(s.write_frame(&mut &data[..], &mut [0u8; 80]).is_err());

        let mut s = XmodemSender::new(1, 64, 2);
        assert_eq!(s.handle(0x99), XmodemStatus::Ignore);
        assert_eq!(s.handle(MsgType::FileDone as u8), XmodemStatus::Ignore);
        assert_eq!(s.handle(MsgType::Cancel as u8), XmodemStatus::Failed);
    }

    #[test]
    fn max_retry_count() {
        let mut s = XmodemSender::new(1, 64, u8::MAX);
        for _ in 0..u8::MAX {
            assert_eq!(s.timeout(), XmodemStatus::Send);
        }
        assert_eq!(s.handle(MsgType::Nak as u8), XmodemStatus::Failed);
    }

    #[test]
    fn block_numbers_wrap() {
        let mut s = XmodemSender::new(1, 300 * 64, 0);
        for _ in 0..255 {
            s.handle(MsgType::Ack as u8);
        }
        assert_eq!(s.block(), 0);
        assert_eq!(s.offset(), 255 * 64);
    }
}
