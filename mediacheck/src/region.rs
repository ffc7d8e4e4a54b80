// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::ops::Range;

/// A half-open range of fixed-size blocks within an image. A region with zero
/// blocks is inactive and intersects nothing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Region {
    pub start: u64,
    pub blocks: u64,
}

impl Region {
    pub fn new(start: u64, blocks: u64) -> Self {
        Self { start, blocks }
    }

    /// One past the last block of the region.
    pub fn end(&self) -> u64 {
        self.start + self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// Compute the byte range within the buffer of chunk `chunk_index` that
    /// falls inside this region, or `None` if the chunk lies entirely outside
    /// it. A region that begins and ends within the same chunk yields the
    /// clipped interior range, not the rest of the chunk.
    pub fn intersect(
        &self,
        chunk_index: u64,
        chunk_blocks: u64,
        block_size: u32,
    ) -> Option<Range<usize>> {
        if self.blocks == 0 {
            return None;
        }

        let chunk_start = chunk_index * chunk_blocks;
        let chunk_end = chunk_start + chunk_blocks;

        let lo = self.start.max(chunk_start);
        let hi = self.end().min(chunk_end);
        if lo >= hi {
            return None;
        }

        let block_size = u64::from(block_size);

        Some(((lo - chunk_start) * block_size) as usize..((hi - chunk_start) * block_size) as usize)
    }
}
