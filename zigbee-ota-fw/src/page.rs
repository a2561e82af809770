// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * OTA page request block accounting.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Page request tracking
//!
//! In page mode a client asks for a whole page and the server streams
//! fixed size blocks. The tracker records which blocks arrived so only
//! gaps are re-requested.

#[allow(unused)]
use log::{debug, info, trace, warn};

use zigbee_ota::{OtaError, Result};

/// Size of each block within a page
pub const PAGE_REQUEST_BLOCK_SIZE: u32 = 32;
/// Largest supported page
pub const MAX_PAGE_SIZE: u16 = 4096;
/// Delay between missed block requests
pub const MISSED_BLOCK_DELAY_MS: u64 = 10;

const BITS_PER_WORD: u16 = 16;
const MAX_BLOCKS: u16 = MAX_PAGE_SIZE / PAGE_REQUEST_BLOCK_SIZE as u16;
const WORDS: usize = (MAX_BLOCKS / BITS_PER_WORD) as usize;

/// State of a page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// No page request active
    None,
    /// Page requested, blocks arriving
    WaitingReplies,
    /// Reply timer expired, re-requesting missed blocks
    RetryMissed,
    /// Every block of the page has been received
    Complete,
    /// A block was already noted
    AlreadyReceived,
    /// Invalid block or page request abandoned
    Error,
}

/// Result of [`PageTracker::next_missed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextMissed {
    /// Request a block at this offset
    Block(u32),
    /// Nothing missing
    Complete,
    /// Not retrying, or nothing arrived and the page was abandoned
    Error,
}

/// Bitmask accounting for one page request
#[derive(Debug)]
pub struct PageTracker {
    page_size: u32,
    timeout_ms: u64,
    status: PageStatus,
    base: u32,
    blocks: u16,
    mask: [u16; WORDS],
}

impl PageTracker {
    /// Creates an idle tracker
    ///
    /// `page_size` must be a non-zero multiple of [`PAGE_REQUEST_BLOCK_SIZE`]
    /// no larger than [`MAX_PAGE_SIZE`].
    pub fn new(page_size: u16, timeout_ms: u64) -> Result<Self> {
        if page_size == 0
            || page_size > MAX_PAGE_SIZE
            || page_size as u32 % PAGE_REQUEST_BLOCK_SIZE != 0
        {
            return Err(OtaError::InvalidCall);
        }
        Ok(Self {
            page_size: page_size as u32,
            timeout_ms,
            status: PageStatus::None,
            base: 0,
            blocks: 0,
            mask: [0; WORDS],
        })
    }

    /// Starts tracking a page at `base` of an image of `total` bytes
    ///
    /// Returns the time to wait for replies before retrying.
    pub fn init(&mut self, base: u32, total: u32) -> u64 {
        self.mask = [0; WORDS];
        self.base = base;
        let remaining = total.saturating_sub(base);
        self.blocks = if remaining < self.page_size {
            remaining.div_ceil(PAGE_REQUEST_BLOCK_SIZE) as u16
        } else {
            (self.page_size / PAGE_REQUEST_BLOCK_SIZE) as u16
        };
        self.status = PageStatus::WaitingReplies;
        trace!("page request at {base}, {} blocks", self.blocks);
        self.timeout_ms
    }

    /// Current status
    pub fn status(&self) -> PageStatus {
        self.status
    }

    /// Whether a page request is active
    pub fn handling(&self) -> bool {
        self.status != PageStatus::None
    }

    /// Page size in bytes
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Offset following the page
    pub fn finished_offset(&self) -> u32 {
        self.base + self.page_size
    }

    /// Offset following the blocks received in sequence from the page start
    pub fn received_offset(&self) -> u32 {
        self.base + self.received_prefix() as u32 * PAGE_REQUEST_BLOCK_SIZE
    }

    /// Abandons the page request
    pub fn abort(&mut self) {
        self.status = PageStatus::None;
    }

    fn bit(&self, n: u16) -> bool {
        self.mask[(n / BITS_PER_WORD) as usize] & (1 << (n % BITS_PER_WORD))
            != 0
    }

    /// Blocks received in sequence from the start of the page
    fn received_prefix(&self) -> u16 {
        (0..self.blocks).take_while(|n| self.bit(*n)).count() as u16
    }

    fn received_count(&self) -> u16 {
        self.mask.iter().map(|w| w.count_ones() as u16).sum()
    }

    /// Records a block received at `offset`
    ///
    /// Returns [`PageStatus::Complete`] once every block in the page has
    /// arrived, in any order. The tracker is then idle.
    pub fn note_received(&mut self, offset: u32) -> PageStatus {
        if !self.handling() {
            return PageStatus::Error;
        }
        if offset < self.base {
            return PageStatus::AlreadyReceived;
        }
        let rel = offset - self.base;
        if rel % PAGE_REQUEST_BLOCK_SIZE != 0 {
            debug!("page block offset {offset} is misaligned");
            return PageStatus::Error;
        }
        let n = rel / PAGE_REQUEST_BLOCK_SIZE;
        if n >= self.blocks as u32 {
            debug!("page block offset {offset} is beyond the page");
            return PageStatus::Error;
        }
        let n = n as u16;
        if self.bit(n) {
            trace!("already received block {}", n + 1);
            return PageStatus::AlreadyReceived;
        }
        self.mask[(n / BITS_PER_WORD) as usize] |= 1 << (n % BITS_PER_WORD);
        trace!("received block {} of {}", n + 1, self.blocks);

        if self.received_count() == self.blocks {
            self.abort();
            return PageStatus::Complete;
        }
        self.status
    }

    /// The reply timer expired
    pub fn timer_expired(&mut self) {
        if self.status == PageStatus::WaitingReplies {
            debug!("page request timer expired, checking for missed blocks");
            self.status = PageStatus::RetryMissed;
        }
    }

    /// Returns the next block to re-request
    ///
    /// The resume point follows the blocks received in sequence from the
    /// start of the page. Blocks received after a gap still count towards
    /// completion but do not move it. If nothing at all arrived the
    /// server is taken as unreachable and the page request is abandoned.
    pub fn next_missed(&mut self) -> NextMissed {
        if self.status != PageStatus::RetryMissed {
            return NextMissed::Error;
        }
        let prefix = self.received_prefix();
        if prefix == self.blocks {
            self.status = PageStatus::Complete;
            return NextMissed::Complete;
        }
        if self.received_count() == 0 {
            warn!("all page blocks missed, server seems unreachable");
            self.abort();
            return NextMissed::Error;
        }
        NextMissed::Block(self.base + prefix as u32 * PAGE_REQUEST_BLOCK_SIZE)
    }
}
