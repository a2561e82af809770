// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2024 Code Construct
 */

//! Helper functions

/// Writes into a borrowed mutable output buffer
///
/// Push methods return `Some(usize)` length on success, `None` on failure.
pub struct SliceWriter<'a> {
    s: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    /// Constructs a new `SliceWriter`
    pub fn new(s: &'a mut [u8]) -> Self {
        Self { s, pos: 0 }
    }

    /// Returns the number of bytes written
    pub fn written(&self) -> usize {
        debug_assert!(self.pos <= self.s.len());
        self.pos
    }

    /// Returns the written buffer
    pub fn done(&mut self) -> &mut [u8] {
        &mut self.s[..self.pos]
    }

    /// Pushes the provided slice into the output buffer
    #[must_use]
    pub fn push(&mut self, s: &[u8]) -> Option<usize> {
        let out = self.s.get_mut(self.pos..self.pos + s.len())?;
        out.copy_from_slice(s);
        self.pos += s.len();
        Some(s.len())
    }

    /// Pushes `len` copies of `v`
    #[must_use]
    pub fn fill(&mut self, v: u8, len: usize) -> Option<usize> {
        let out = self.s.get_mut(self.pos..self.pos + len)?;
        out.fill(v);
        self.pos += len;
        Some(len)
    }

    fn push_le<S>(&mut self, v: S) -> Option<usize>
    where
        S: num_traits::ToBytes,
    {
        self.push(v.to_le_bytes().as_ref())
    }

    /// Pushes a `u32` into the output buffer, little-endian
    ///
    /// Returns the length written or `None` on insufficient space.
    #[inline]
    #[must_use]
    pub fn push_le32(&mut self, v: u32) -> Option<usize> {
        self.push_le(v)
    }

    /// Pushes a `u16` into the output buffer, little-endian
    ///
    /// Returns the length written or `None` on insufficient space.
    #[inline]
    #[must_use]
    pub fn push_le16(&mut self, v: u16) -> Option<usize> {
        self.push_le(v)
    }

    /// Pushes a `u8` into the output buffer
    ///
    /// Returns the length written or `None` on insufficient space.
    #[inline]
    #[must_use]
    pub fn push_le8(&mut self, v: u8) -> Option<usize> {
        self.push_le(v)
    }

    /// Pushes a `u16` into the output buffer, big-endian
    ///
    /// The standalone bootloader protocol carries some fields big-endian.
    #[inline]
    #[must_use]
    pub fn push_be16(&mut self, v: u16) -> Option<usize> {
        self.push(&v.to_be_bytes())
    }
}

/// Helper for converting `Option::None` to `OtaError::NoSpace`
///
/// `SliceWriter` returns `None` on failure. This trait converts
/// that failure to a `OtaError::NoSpace` for brevity.
pub trait NoneNoSpace<S> {
    /// Returns `OtaError::NoSpace` on failure
    fn space(self) -> crate::Result<S>;
}

impl<S> NoneNoSpace<S> for Option<S> {
    fn space(self) -> crate::Result<S> {
        self.ok_or(crate::OtaError::NoSpace)
    }
}
