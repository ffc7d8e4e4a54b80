// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Single-pass digest computation over the regions of a media image.
//!
//! One sequential read covers every region at once: each chunk is routed
//! through the full-image digest first, then normalized in place, then routed
//! through the filesystem and partition digests. Fragment checkpoints snapshot
//! the running filesystem digest so a corrupted image can be rejected without
//! reading the whole file.

use std::{
    fmt,
    io::Read,
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    digest::{self, MediaDigest},
    format::iso::{self, MediaImage},
    region::Region,
    sign::{
        SIGNATURE_BLOCK_SIZE, SIGNATURE_MAGIC_SIZE, SignState, SignatureVerifier, Verdict,
    },
    stream, util,
};

/// Read chunk size. A multiple of every supported block size.
pub const CHUNK_SIZE: usize = 64 << 10;

/// Smallest chunk size the normalization logic was designed around: a chunk
/// this large always covers the application data area in the first chunk, so
/// no normalized field ever spans more than two chunks. Smaller chunks still
/// work; they just lose that guarantee.
pub const MIN_CHUNK_SIZE: usize = 36 << 10;

/// Size of the boot record area at the start of the image that is zeroed
/// before the filesystem digests are computed.
pub const BOOT_RECORD_LENGTH: usize = 0x200;

/// Total length of the fragment checksum string. Each of the N checkpoints
/// contributes `FRAGMENT_SUM_LENGTH / N` hex digits.
pub const FRAGMENT_SUM_LENGTH: usize = 60;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid reference digest for {0} region")]
    InvalidReference(&'static str, #[source] digest::Error),
    #[error("Padding ({pad_blocks} + {skip_blocks} blocks) exceeds filesystem size ({iso_blocks} blocks)")]
    InvalidPadding {
        pad_blocks: u64,
        skip_blocks: u64,
        iso_blocks: u64,
    },
    #[error("Fragment reference checksum has length {0}, expected {FRAGMENT_SUM_LENGTH}")]
    InvalidFragmentSums(usize),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    Full,
    Filesystem,
    Partition,
}

impl RegionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Filesystem => "iso",
            Self::Partition => "partition",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One region of the image and the digest accumulating over it. Raw pairs hash
/// the bytes as stored; the others hash the normalized bytes.
#[derive(Clone, Debug)]
pub struct RegionDigest {
    pub kind: RegionKind,
    pub region: Region,
    pub digest: MediaDigest,
    raw: bool,
    pad_blocks: u64,
}

/// A byte range whose on-disk contents are excluded from the filesystem
/// digests by convention and replaced with a fill byte before hashing.
#[derive(Clone, Copy, Debug)]
struct Normalization {
    offset: u64,
    len: usize,
    fill: u8,
}

impl Normalization {
    /// Overwrite the part of this range that falls inside the chunk buffer
    /// starting at `chunk_start_byte`. Ranges may span chunk boundaries.
    fn apply(&self, chunk_start_byte: u64, data: &mut [u8]) {
        let chunk_end_byte = chunk_start_byte + data.len() as u64;

        let lo = self.offset.max(chunk_start_byte);
        let hi = (self.offset + self.len as u64).min(chunk_end_byte);

        if lo < hi {
            data[(lo - chunk_start_byte) as usize..(hi - chunk_start_byte) as usize]
                .fill(self.fill);
        }
    }
}

/// Incremental early-abort state. Checkpoints are evenly spaced byte positions
/// within the filesystem region; at each one, a snapshot of the running digest
/// contributes a fixed number of hex digits to the accumulated checksum, which
/// must remain a prefix of the reference checksum.
#[derive(Clone, Debug)]
struct Fragments {
    count: u32,
    sums_ref: String,
    sums: String,
    checked: u32,
    failed: Option<u32>,
    boundaries: Vec<u64>,
    fed: u64,
}

impl Fragments {
    /// Route filesystem-region bytes into the digest, pausing at each
    /// checkpoint boundary. Returns `true` on checksum mismatch.
    fn feed(&mut self, digest: &mut MediaDigest, mut data: &[u8]) -> bool {
        loop {
            let Some(&boundary) = self.boundaries.get(self.checked as usize) else {
                break;
            };

            if boundary > self.fed + data.len() as u64 {
                break;
            }

            let take = (boundary - self.fed) as usize;
            digest.process(&data[..take]);
            self.fed = boundary;
            data = &data[take..];

            if !self.checkpoint(digest) {
                return true;
            }
        }

        digest.process(data);
        self.fed += data.len() as u64;

        false
    }

    /// Snapshot the running digest without disturbing it and compare the
    /// accumulated checksum against the reference prefix. Returns `false` on
    /// mismatch.
    fn checkpoint(&mut self, digest: &MediaDigest) -> bool {
        let mut snapshot = digest.clone();
        let hex = snapshot.hex();

        let take = (FRAGMENT_SUM_LENGTH / self.count as usize).min(hex.len());
        self.sums.push_str(&hex[..take]);
        self.checked += 1;

        debug!("Fragment {} checksum: {:?}", self.checked, &hex[..take]);

        if !self.sums_ref.starts_with(self.sums.as_str()) {
            self.failed = Some(self.checked - 1);
            return false;
        }

        true
    }
}

/// Block offset at which a read failed during the pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadFailure {
    pub block: u64,
}

/// State for one verification pass over one image. Independent instances share
/// nothing; verifying two files concurrently just means two verifiers.
pub struct Verifier {
    media: MediaImage,
    pairs: Vec<RegionDigest>,
    normalizations: Vec<Normalization>,
    fragments: Option<Fragments>,
    sign_state: SignState,
    signed_by: Option<String>,
    read_failure: Option<ReadFailure>,
    aborted: bool,
    last_percent: Option<u8>,
    chunk_size: usize,
}

impl Verifier {
    pub fn new(media: MediaImage) -> Result<Self> {
        let iso_digest = match &media.iso_reference {
            Some(hex) => MediaDigest::new(None, Some(hex))
                .map_err(|e| Error::InvalidReference("iso", e))?,
            None => MediaDigest::none(),
        };
        let part_digest = match &media.part_reference {
            Some(hex) => MediaDigest::new(None, Some(hex))
                .map_err(|e| Error::InvalidReference("partition", e))?,
            None => MediaDigest::none(),
        };

        // The full-image digest has no reference value; it mirrors whichever
        // algorithm the metadata used.
        let full_digest = match iso_digest.algorithm().or_else(|| part_digest.algorithm()) {
            Some(algorithm) => MediaDigest::from_algorithm(algorithm),
            None => MediaDigest::none(),
        };

        if media.iso_blocks > 0 && media.pad_blocks + media.skip_blocks >= media.iso_blocks {
            return Err(Error::InvalidPadding {
                pad_blocks: media.pad_blocks,
                skip_blocks: media.skip_blocks,
                iso_blocks: media.iso_blocks,
            });
        }

        let iso_region = Region::new(
            0,
            media
                .iso_blocks
                .saturating_sub(media.pad_blocks + media.skip_blocks),
        );

        let fragments = if media.fragment_count > 0
            && !iso_region.is_empty()
            && iso_digest.algorithm().is_some()
        {
            if media.fragment_sums.len() != FRAGMENT_SUM_LENGTH {
                return Err(Error::InvalidFragmentSums(media.fragment_sums.len()));
            }

            let region_bytes = iso_region.blocks * u64::from(media.block_size);
            let count = u64::from(media.fragment_count);
            let boundaries = (1..=count).map(|k| k * region_bytes / (count + 1)).collect();

            Some(Fragments {
                count: media.fragment_count,
                sums_ref: media.fragment_sums.clone(),
                sums: String::new(),
                checked: 0,
                failed: None,
                boundaries,
                fed: 0,
            })
        } else {
            None
        };

        let mut normalizations = vec![
            Normalization {
                offset: 0,
                len: BOOT_RECORD_LENGTH,
                fill: 0,
            },
            Normalization {
                offset: iso::APP_DATA_OFFSET,
                len: iso::APP_DATA_LENGTH,
                fill: b' ',
            },
        ];

        if let Some(signature) = &media.signature {
            // Everything beyond the magic prefix is zeroed so that embedding
            // the signature does not change the digests it signs off on.
            normalizations.push(Normalization {
                offset: signature.start_block * u64::from(media.block_size)
                    + SIGNATURE_MAGIC_SIZE as u64,
                len: SIGNATURE_BLOCK_SIZE - SIGNATURE_MAGIC_SIZE,
                fill: 0,
            });
        }

        let sign_state = if media.signature.is_some() {
            SignState::NotChecked
        } else {
            SignState::NotSigned
        };

        let pairs = vec![
            RegionDigest {
                kind: RegionKind::Full,
                region: Region::new(0, media.full_blocks),
                digest: full_digest,
                raw: true,
                pad_blocks: 0,
            },
            RegionDigest {
                kind: RegionKind::Filesystem,
                region: iso_region,
                digest: iso_digest,
                raw: false,
                pad_blocks: media.pad_blocks,
            },
            RegionDigest {
                kind: RegionKind::Partition,
                region: Region::new(media.part_start, media.part_blocks),
                digest: part_digest,
                raw: false,
                pad_blocks: 0,
            },
        ];

        Ok(Self {
            media,
            pairs,
            normalizations,
            fragments,
            sign_state,
            signed_by: None,
            read_failure: None,
            aborted: false,
            last_percent: None,
            chunk_size: CHUNK_SIZE,
        })
    }

    /// Override the read chunk size. Must be a non-zero multiple of the block
    /// size. Sizes below [`MIN_CHUNK_SIZE`] lose the guarantee that a
    /// normalized field spans at most two chunks, which is harmless here
    /// because normalization clips against each chunk independently.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        assert!(size > 0 && size % self.media.block_size as usize == 0);
        self.chunk_size = size;
        self
    }

    pub fn media(&self) -> &MediaImage {
        &self.media
    }

    fn pair_index(kind: RegionKind) -> usize {
        match kind {
            RegionKind::Full => 0,
            RegionKind::Filesystem => 1,
            RegionKind::Partition => 2,
        }
    }

    pub fn digest(&self, kind: RegionKind) -> &MediaDigest {
        &self.pairs[Self::pair_index(kind)].digest
    }

    pub fn digest_mut(&mut self, kind: RegionKind) -> &mut MediaDigest {
        &mut self.pairs[Self::pair_index(kind)].digest
    }

    pub fn fragment_sums(&self) -> &str {
        self.fragments.as_ref().map_or("", |f| f.sums.as_str())
    }

    pub fn fragment_sums_ref(&self) -> &str {
        self.fragments.as_ref().map_or("", |f| f.sums_ref.as_str())
    }

    pub fn fragments_checked(&self) -> u32 {
        self.fragments.as_ref().map_or(0, |f| f.checked)
    }

    pub fn failed_fragment(&self) -> Option<u32> {
        self.fragments.as_ref().and_then(|f| f.failed)
    }

    pub fn fragments_ok(&self) -> bool {
        self.fragments.as_ref().is_none_or(|f| f.failed.is_none())
    }

    pub fn sign_state(&self) -> SignState {
        self.sign_state
    }

    pub fn signed_by(&self) -> Option<&str> {
        self.signed_by.as_deref()
    }

    pub fn read_failure(&self) -> Option<ReadFailure> {
        self.read_failure
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Run the verification pass. The reader must be positioned at the start
    /// of the image. All failures are recorded in the verifier state: a short
    /// read, a fragment mismatch, a raised cancel flag, or an abort requested
    /// by the progress callback each invalidate every digest.
    ///
    /// `cancel_signal` is sampled at every chunk boundary, independently of
    /// progress reporting. `progress` is called with a percentage whenever it
    /// changes; the first call is for 0% and, unless the pass stops early, the
    /// last is for 100%. Returning `true` aborts the pass at the next chunk
    /// boundary.
    pub fn run(
        &mut self,
        mut reader: impl Read,
        cancel_signal: &AtomicBool,
        progress: &mut dyn FnMut(u8) -> bool,
    ) {
        let block_size = u64::from(self.media.block_size);
        let chunk_blocks = self.chunk_size as u64 / block_size;
        let total_blocks = self
            .pairs
            .iter()
            .map(|p| p.region.end())
            .max()
            .unwrap_or_default();
        let mut buf = vec![0u8; self.chunk_size];

        // The first report is always for 0%, even for a zero-length image.
        self.last_percent = Some(0);
        if progress(0) {
            self.abort();
            return;
        }

        for chunk in 0..total_blocks.div_ceil(chunk_blocks) {
            if cancel_signal.load(Ordering::SeqCst) {
                self.abort();
                return;
            }

            let chunk_start = chunk * chunk_blocks;
            let want_blocks = chunk_blocks.min(total_blocks - chunk_start);
            let want = (want_blocks * block_size) as usize;

            let got = match stream::read_full(&mut reader, &mut buf[..want]) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Read failed at block {chunk_start}: {e}");
                    0
                }
            };

            if got < want {
                self.read_failure = Some(ReadFailure {
                    block: chunk_start + (got as u64 / block_size),
                });
                self.invalidate();
                return;
            }

            if self.process_chunk(chunk, chunk_blocks, &mut buf[..want]) {
                // Fragment mismatch: none of the partially-computed digests
                // can be reported as trustworthy.
                self.aborted = true;
                self.invalidate();
                return;
            }

            if self.report(progress, chunk_start + want_blocks) {
                self.abort();
                return;
            }
        }

        // The filesystem digest covers declared padding that is not stored in
        // the file.
        for pair in &mut self.pairs {
            for _ in 0..pair.pad_blocks {
                pair.digest.process(&util::ZEROS[..block_size as usize]);
            }
        }

        for pair in &mut self.pairs {
            pair.digest.finalize();
        }

        let _ = self.report(progress, self.media.full_blocks);
    }

    /// Record the verdict of the external signature verifier. Does nothing
    /// unless a signature block was found and not yet checked; the state only
    /// ever moves forward.
    pub fn check_signature(&mut self, verifier: &dyn SignatureVerifier) {
        if self.sign_state != SignState::NotChecked {
            return;
        }
        let Some(signature) = &self.media.signature else {
            return;
        };

        let next = match verifier.verify(&signature.blob, &signature.signature) {
            Ok(Verdict::Good { signer }) => {
                self.signed_by = Some(signer);
                SignState::Ok
            }
            Ok(Verdict::Bad) => SignState::Bad,
            Ok(Verdict::NoMatchingKey) => SignState::BadNoMatchingKey,
            Err(e) => {
                warn!("Signature verifier unavailable: {e}");
                SignState::Bad
            }
        };

        debug_assert!(self.sign_state.can_advance_to(next));
        self.sign_state = next;
    }

    fn process_chunk(&mut self, chunk: u64, chunk_blocks: u64, data: &mut [u8]) -> bool {
        let block_size = self.media.block_size;
        let chunk_start_byte = chunk * chunk_blocks * u64::from(block_size);

        // The full-image digest sees the bytes exactly as stored; it must be
        // fed before any normalization touches the buffer.
        for pair in self.pairs.iter_mut().filter(|p| p.raw) {
            if let Some(range) = pair.region.intersect(chunk, chunk_blocks, block_size) {
                pair.digest.process(&data[range]);
            }
        }

        for normalization in &self.normalizations {
            normalization.apply(chunk_start_byte, data);
        }

        let Self {
            pairs, fragments, ..
        } = self;

        for pair in pairs.iter_mut().filter(|p| !p.raw) {
            let Some(range) = pair.region.intersect(chunk, chunk_blocks, block_size) else {
                continue;
            };

            match fragments {
                Some(f) if pair.kind == RegionKind::Filesystem => {
                    if f.feed(&mut pair.digest, &data[range]) {
                        return true;
                    }
                }
                _ => pair.digest.process(&data[range]),
            }
        }

        false
    }

    fn report(&mut self, progress: &mut dyn FnMut(u8) -> bool, blocks_done: u64) -> bool {
        let percent = if self.media.full_blocks == 0 {
            100
        } else {
            (blocks_done * 100 / self.media.full_blocks).min(100) as u8
        };

        if self.last_percent == Some(percent) {
            return false;
        }
        self.last_percent = Some(percent);

        progress(percent)
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.invalidate();
    }

    fn invalidate(&mut self) {
        for pair in &mut self.pairs {
            pair.digest.finalize();
            pair.digest.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use sha2::{Digest as _, Sha256};

    use crate::sign::{self, SignatureInfo};

    use super::*;

    const PLACEHOLDER_SHA256: &str =
        "0000000000000000000000000000000000000000000000000000000000000000";
    const EMPTY_SHA256: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn test_media(full_blocks: u64, iso_blocks: u64, pad_blocks: u64) -> MediaImage {
        MediaImage {
            block_size: 512,
            full_blocks,
            iso_blocks,
            pad_blocks,
            skip_blocks: 0,
            part_start: 0,
            part_blocks: 0,
            app_id: String::new(),
            tags: vec![],
            iso_reference: None,
            part_reference: None,
            fragment_count: 0,
            fragment_sums: String::new(),
            signature: None,
        }
    }

    fn image_bytes(blocks: u64) -> Vec<u8> {
        (0..blocks * 512).map(|i| (i % 251) as u8).collect()
    }

    /// Byte stream the filesystem digest is defined over, excluding padding.
    fn normalized(data: &[u8]) -> Vec<u8> {
        let mut result = data.to_vec();

        let boot = BOOT_RECORD_LENGTH.min(result.len());
        result[..boot].fill(0);

        let start = iso::APP_DATA_OFFSET as usize;
        if start < result.len() {
            let end = (start + iso::APP_DATA_LENGTH).min(result.len());
            result[start..end].fill(b' ');
        }

        result
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn digest_is_chunking_independent() {
        let data = image_bytes(96);
        let expected_iso = sha256_hex(&normalized(&data));
        let expected_full = sha256_hex(&data);

        for chunk_size in [512, 1024, 4096, 8192, 49152] {
            let mut media = test_media(96, 96, 0);
            media.iso_reference = Some(expected_iso.clone());

            let mut verifier = Verifier::new(media).unwrap().with_chunk_size(chunk_size);
            verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);

            assert!(
                verifier.digest_mut(RegionKind::Filesystem).is_ok(),
                "chunk size {chunk_size}",
            );
            assert_eq!(verifier.digest_mut(RegionKind::Full).hex(), expected_full);
            assert!(verifier.digest(RegionKind::Full).is_valid());
        }
    }

    #[test]
    fn empty_region_receives_no_bytes() {
        let data = image_bytes(16);

        let mut media = test_media(16, 16, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());
        // Zero-length partition with the empty-input digest as reference: the
        // partition digest must match iff no bytes were routed to it.
        media.part_start = 4;
        media.part_blocks = 0;
        media.part_reference = Some(EMPTY_SHA256.to_owned());

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);

        assert!(verifier.digest_mut(RegionKind::Partition).is_ok());
    }

    #[test]
    fn partition_within_a_single_chunk() {
        let data = image_bytes(24);

        // Chunk size 8 blocks; all three placements stay inside chunk 1.
        for (start, blocks) in [(8u64, 2u64), (10, 3), (14, 2)] {
            let expected =
                sha256_hex(&data[(start * 512) as usize..((start + blocks) * 512) as usize]);

            let mut media = test_media(24, 24, 0);
            media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());
            media.part_start = start;
            media.part_blocks = blocks;
            media.part_reference = Some(expected);

            let mut verifier = Verifier::new(media).unwrap().with_chunk_size(4096);
            verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);

            assert!(
                verifier.digest_mut(RegionKind::Partition).is_ok(),
                "placement ({start}, {blocks})",
            );
        }
    }

    #[test]
    fn three_chunk_scenario() {
        // File of exactly 3 two-block chunks with constant-byte contents.
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00u8; 1024]);
        data.extend_from_slice(&[0x11u8; 1024]);
        data.extend_from_slice(&[0x22u8; 1024]);

        // Filesystem region is blocks [0, 5) plus one pad block; partition
        // covers the last half of chunk 1 and the first half of chunk 2.
        let mut iso_stream = normalized(&data[..5 * 512]);
        iso_stream.extend_from_slice(&[0u8; 512]);
        let expected_iso = sha256_hex(&iso_stream);

        let mut part_stream = vec![0x11u8; 512];
        part_stream.extend_from_slice(&[0x22u8; 512]);
        let expected_part = sha256_hex(&part_stream);

        let expected_full = sha256_hex(&data);

        let mut media = test_media(6, 6, 1);
        media.iso_reference = Some(expected_iso);
        media.part_start = 3;
        media.part_blocks = 2;
        media.part_reference = Some(expected_part);

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);

        let mut percents = Vec::new();
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |percent| {
            percents.push(percent);
            false
        });

        assert!(verifier.digest_mut(RegionKind::Filesystem).is_ok());
        assert!(verifier.digest_mut(RegionKind::Partition).is_ok());
        assert_eq!(verifier.digest_mut(RegionKind::Full).hex(), expected_full);

        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn normalization_leaves_other_bytes_untouched() {
        let normalizations = [
            Normalization {
                offset: 0,
                len: BOOT_RECORD_LENGTH,
                fill: 0,
            },
            Normalization {
                offset: iso::APP_DATA_OFFSET,
                len: iso::APP_DATA_LENGTH,
                fill: b' ',
            },
        ];

        let mut chunk = vec![0xffu8; 64 << 10];
        for normalization in &normalizations {
            normalization.apply(0, &mut chunk);
        }

        let tag_start = iso::APP_DATA_OFFSET as usize;
        let tag_end = tag_start + iso::APP_DATA_LENGTH;

        assert!(util::is_zero(&chunk[..0x200]));
        assert!(chunk[tag_start..tag_end].iter().all(|b| *b == b' '));
        assert!(chunk[0x200..tag_start].iter().all(|b| *b == 0xff));
        assert!(chunk[tag_end..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn normalization_spans_chunk_boundaries() {
        let normalization = Normalization {
            offset: iso::APP_DATA_OFFSET,
            len: iso::APP_DATA_LENGTH,
            fill: b' ',
        };

        // 1 KiB chunks: the range covers the tail of chunk 32 and the head of
        // chunk 33.
        let mut first = vec![0xffu8; 1024];
        normalization.apply(32 * 1024, &mut first);
        assert!(first[..0x373].iter().all(|b| *b == 0xff));
        assert!(first[0x373..].iter().all(|b| *b == b' '));

        let mut second = vec![0xffu8; 1024];
        normalization.apply(33 * 1024, &mut second);
        assert!(second[..0x173].iter().all(|b| *b == b' '));
        assert!(second[0x173..].iter().all(|b| *b == 0xff));
    }

    fn fragment_reference(data: &[u8], count: u64) -> String {
        let region = normalized(data);
        let region_bytes = region.len() as u64;
        let per_fragment = FRAGMENT_SUM_LENGTH / count as usize;

        let mut hasher = Sha256::new();
        let mut sums = String::new();
        let mut fed = 0usize;

        for k in 1..=count {
            let boundary = (k * region_bytes / (count + 1)) as usize;
            hasher.update(&region[fed..boundary]);
            fed = boundary;

            let hex = hex::encode(hasher.clone().finalize());
            sums.push_str(&hex[..per_fragment]);
        }

        sums
    }

    #[test]
    fn fragment_checkpoints_accumulate() {
        let data = image_bytes(256);
        let sums = fragment_reference(&data, 4);
        assert_eq!(sums.len(), FRAGMENT_SUM_LENGTH);

        let mut media = test_media(256, 256, 0);
        media.iso_reference = Some(sha256_hex(&normalized(&data)));
        media.fragment_count = 4;
        media.fragment_sums = sums.clone();

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(8192);
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);

        assert!(verifier.fragments_ok());
        assert_eq!(verifier.fragments_checked(), 4);
        assert_eq!(verifier.fragment_sums(), sums);
        assert_eq!(verifier.fragment_sums_ref(), sums);
        assert!(verifier.digest_mut(RegionKind::Filesystem).is_ok());
        assert!(!verifier.aborted());
    }

    #[test]
    fn fragment_mismatch_aborts_early() {
        let mut data = image_bytes(256);
        let sums = fragment_reference(&data, 4);

        // Corrupt a byte in the first eighth of the filesystem region, outside
        // the normalized areas.
        data[1000] ^= 0x01;

        let mut media = test_media(256, 256, 0);
        media.iso_reference = Some(sha256_hex(&normalized(&data)));
        media.fragment_count = 4;
        media.fragment_sums = sums;

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(8192);

        let mut max_percent = 0u8;
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |percent| {
            max_percent = max_percent.max(percent);
            false
        });

        // The first checkpoint sits at 20% of the region; the abort must come
        // long before the halfway point.
        assert!(max_percent < 50, "reached {max_percent}%");
        assert!(verifier.aborted());
        assert!(!verifier.fragments_ok());
        assert_eq!(verifier.failed_fragment(), Some(0));
        assert!(!verifier.digest(RegionKind::Filesystem).is_valid());
        assert!(!verifier.digest(RegionKind::Full).is_valid());
        assert!(!verifier.digest(RegionKind::Partition).is_valid());
    }

    #[test]
    fn zero_fragments_disable_checking() {
        let data = image_bytes(16);

        let mut media = test_media(16, 16, 0);
        media.iso_reference = Some(sha256_hex(&normalized(&data)));

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);

        assert!(verifier.fragments_ok());
        assert_eq!(verifier.fragments_checked(), 0);
        assert_eq!(verifier.fragment_sums(), "");
        assert!(verifier.digest_mut(RegionKind::Filesystem).is_ok());
    }

    #[test]
    fn invalid_fragment_sums_length_is_rejected() {
        let mut media = test_media(16, 16, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());
        media.fragment_count = 4;
        media.fragment_sums = "abcdef".to_owned();

        assert!(matches!(
            Verifier::new(media),
            Err(Error::InvalidFragmentSums(6))
        ));
    }

    #[test]
    fn short_read_invalidates_everything() {
        // The image claims 10 blocks but only 8 are readable.
        let data = image_bytes(8);

        let mut media = test_media(10, 10, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);

        assert_eq!(verifier.read_failure(), Some(ReadFailure { block: 8 }));
        assert!(!verifier.digest(RegionKind::Filesystem).is_valid());
        assert!(!verifier.digest(RegionKind::Full).is_valid());
        assert!(!verifier.digest(RegionKind::Partition).is_valid());
    }

    #[test]
    fn mid_chunk_short_read_records_exact_block() {
        let data = image_bytes(9);

        let mut media = test_media(10, 10, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);

        assert_eq!(verifier.read_failure(), Some(ReadFailure { block: 9 }));
    }

    #[test]
    fn read_error_invalidates_everything() {
        struct FailingReader;

        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("device error"))
            }
        }

        let mut media = test_media(10, 10, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);
        verifier.run(FailingReader, &AtomicBool::new(false), &mut |_| false);

        assert_eq!(verifier.read_failure(), Some(ReadFailure { block: 0 }));
        assert!(!verifier.digest(RegionKind::Full).is_valid());
    }

    #[test]
    fn progress_callback_can_cancel() {
        let data = image_bytes(16);

        let mut media = test_media(16, 16, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);
        let mut percents = Vec::new();
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |percent| {
            percents.push(percent);
            percent >= 50
        });

        assert!(verifier.aborted());
        assert!(!verifier.digest(RegionKind::Full).is_valid());
        assert!(percents.last().is_some_and(|p| *p < 100));
    }

    /// Reader that raises the cancel flag as soon as any bytes are served.
    struct CancellingReader<'a> {
        inner: Cursor<&'a [u8]>,
        cancel: &'a AtomicBool,
        served: usize,
    }

    impl Read for CancellingReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.served += n;
            self.cancel.store(true, Ordering::SeqCst);
            Ok(n)
        }
    }

    #[test]
    fn cancel_flag_is_sampled_at_every_chunk_boundary() {
        // 1024-byte chunks over 256 blocks: the percentage stays at 0% well
        // past the first chunk, so the flag has to be noticed even though no
        // progress report happens in between.
        let data = image_bytes(256);

        let mut media = test_media(256, 256, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());

        let cancel = AtomicBool::new(false);
        let mut reader = CancellingReader {
            inner: Cursor::new(data.as_slice()),
            cancel: &cancel,
            served: 0,
        };

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(1024);
        let mut percents = Vec::new();
        verifier.run(&mut reader, &cancel, &mut |percent| {
            percents.push(percent);
            false
        });

        assert!(verifier.aborted());
        assert!(!verifier.digest(RegionKind::Full).is_valid());
        // Only the first chunk was read before the abort.
        assert_eq!(reader.served, 1024);
        assert_eq!(percents, vec![0]);
    }

    #[test]
    fn zero_length_image_still_reports_zero_first() {
        let media = test_media(0, 0, 0);

        let mut verifier = Verifier::new(media).unwrap();
        let mut percents = Vec::new();
        verifier.run(
            Cursor::new(&[][..]),
            &AtomicBool::new(false),
            &mut |percent| {
                percents.push(percent);
                false
            },
        );

        assert_eq!(percents, vec![0, 100]);
    }

    #[test]
    fn skip_blocks_are_excluded_without_replacement() {
        let data = image_bytes(256);

        // One skipped sector: the filesystem digest covers four fewer blocks
        // and no substitute bytes.
        let mut media = test_media(256, 256, 0);
        media.skip_blocks = 4;
        media.iso_reference = Some(sha256_hex(&normalized(&data)[..252 * 512]));

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(8192);
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);
        assert!(verifier.digest_mut(RegionKind::Filesystem).is_ok());

        // Combined with padding, the skipped blocks still get no replacement
        // while the pad blocks are synthesized as zeros.
        let mut media = test_media(256, 256, 8);
        media.skip_blocks = 4;
        let mut stream = normalized(&data)[..244 * 512].to_vec();
        stream.extend_from_slice(&[0u8; 8 * 512]);
        media.iso_reference = Some(sha256_hex(&stream));

        let mut verifier = Verifier::new(media).unwrap().with_chunk_size(8192);
        verifier.run(Cursor::new(&data), &AtomicBool::new(false), &mut |_| false);
        assert!(verifier.digest_mut(RegionKind::Filesystem).is_ok());
    }

    #[test]
    fn invalid_padding_is_rejected() {
        let mut media = test_media(16, 8, 8);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());

        assert!(matches!(
            Verifier::new(media),
            Err(Error::InvalidPadding { .. })
        ));
    }

    struct StubVerifier(sign::Verdict);

    impl SignatureVerifier for StubVerifier {
        fn verify(&self, _blob: &[u8], _signature: &str) -> sign::Result<Verdict> {
            Ok(self.0.clone())
        }
    }

    fn signed_media() -> MediaImage {
        let mut media = test_media(16, 16, 0);
        media.signature = Some(SignatureInfo {
            start_block: 12,
            blob: vec![b'x'; 0x200],
            signature: "-----BEGIN PGP SIGNATURE-----\n".to_owned(),
        });
        media
    }

    #[test]
    fn signature_state_machine() {
        let verifier = Verifier::new(signed_media()).unwrap();
        assert_eq!(verifier.sign_state(), SignState::NotChecked);

        let mut good = Verifier::new(signed_media()).unwrap();
        good.check_signature(&StubVerifier(Verdict::Good {
            signer: "Build Service <build@example.com>".to_owned(),
        }));
        assert_eq!(good.sign_state(), SignState::Ok);
        assert_eq!(good.signed_by(), Some("Build Service <build@example.com>"));

        // Terminal state: a second check never runs the verifier again.
        good.check_signature(&PanickingVerifier);
        assert_eq!(good.sign_state(), SignState::Ok);

        let mut bad = Verifier::new(signed_media()).unwrap();
        bad.check_signature(&StubVerifier(Verdict::Bad));
        assert_eq!(bad.sign_state(), SignState::Bad);

        let mut no_key = Verifier::new(signed_media()).unwrap();
        no_key.check_signature(&StubVerifier(Verdict::NoMatchingKey));
        assert_eq!(no_key.sign_state(), SignState::BadNoMatchingKey);
    }

    struct PanickingVerifier;

    impl SignatureVerifier for PanickingVerifier {
        fn verify(&self, _blob: &[u8], _signature: &str) -> sign::Result<Verdict> {
            panic!("verifier must not be invoked");
        }
    }

    #[test]
    fn unsigned_media_never_invokes_the_verifier() {
        let mut media = test_media(16, 16, 0);
        media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());

        let mut verifier = Verifier::new(media).unwrap();
        assert_eq!(verifier.sign_state(), SignState::NotSigned);

        verifier.check_signature(&PanickingVerifier);
        assert_eq!(verifier.sign_state(), SignState::NotSigned);
    }

    struct UnavailableVerifier;

    impl SignatureVerifier for UnavailableVerifier {
        fn verify(&self, _blob: &[u8], _signature: &str) -> sign::Result<Verdict> {
            Err(sign::Error::TempDir(io::Error::other("unavailable")))
        }
    }

    #[test]
    fn unavailable_verifier_maps_to_bad() {
        let mut verifier = Verifier::new(signed_media()).unwrap();
        verifier.check_signature(&UnavailableVerifier);
        assert_eq!(verifier.sign_state(), SignState::Bad);
    }

    #[test]
    fn signature_block_is_normalized_out_of_the_filesystem_digest() {
        // Two otherwise identical images, one with signature bytes present,
        // must produce the same filesystem digest.
        let blocks = 80u64;
        let plain = image_bytes(blocks);

        let mut signed = plain.clone();
        let sig_start = 72 * 512;
        signed[sig_start..sig_start + sign::SIGNATURE_MAGIC.len()]
            .copy_from_slice(sign::SIGNATURE_MAGIC);
        for b in &mut signed[sig_start + SIGNATURE_MAGIC_SIZE..sig_start + SIGNATURE_BLOCK_SIZE] {
            *b = 0xaa;
        }

        let run = |data: &[u8], signature: Option<SignatureInfo>| {
            let mut media = test_media(blocks, blocks, 0);
            media.iso_reference = Some(PLACEHOLDER_SHA256.to_owned());
            media.signature = signature;

            let mut verifier = Verifier::new(media).unwrap().with_chunk_size(4096);
            verifier.run(Cursor::new(data), &AtomicBool::new(false), &mut |_| false);
            (
                verifier.digest_mut(RegionKind::Filesystem).hex(),
                verifier.digest_mut(RegionKind::Full).hex(),
            )
        };

        let signature = SignatureInfo {
            start_block: 72,
            blob: vec![0u8; 0x200],
            signature: "sig".to_owned(),
        };

        // The plain image needs the same magic prefix for the digests to line
        // up, since the prefix itself is preserved.
        let mut plain_with_magic = plain.clone();
        plain_with_magic[sig_start..sig_start + sign::SIGNATURE_MAGIC.len()]
            .copy_from_slice(sign::SIGNATURE_MAGIC);
        for b in &mut plain_with_magic
            [sig_start + SIGNATURE_MAGIC_SIZE..sig_start + SIGNATURE_BLOCK_SIZE]
        {
            *b = 0;
        }

        let (iso_a, full_a) = run(&plain_with_magic, Some(signature.clone()));
        let (iso_b, full_b) = run(&signed, Some(signature));

        assert_eq!(iso_a, iso_b);
        // The full-image digest reflects the stored bytes and must differ.
        assert_ne!(full_a, full_b);
    }
}
