// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Extraction of verification metadata from an ISO9660 image. Only the handful
//! of fixed-offset fields that the media check needs are decoded; this is not
//! a general filesystem parser.

use std::io::{self, Read, Seek, SeekFrom};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::tags::{self, Tag},
    sign::{SIGNATURE_BLOCK_SIZE, SIGNATURE_MAGIC, SIGNATURE_MAGIC_SIZE, SignatureInfo},
    stream::ReadFixedSizeExt,
    util,
};

/// Block size all region and offset fields are expressed in.
pub const BLOCK_SIZE: u32 = 512;

/// ISO9660 sectors are 2 KiB; sizes read from the volume descriptor and from
/// `pad`/`skip` tags are in this unit.
const SECTOR_BLOCKS: u64 = 4;

/// Volume space size field of the primary volume descriptor (stored in both
/// endiannesses).
const VOLUME_SIZE_OFFSET: u64 = 0x8050;

/// Application id field of the primary volume descriptor.
const APP_ID_OFFSET: u64 = 0x823e;
pub const APP_ID_LENGTH: usize = 0x80;

/// Application use area of the primary volume descriptor. The mastering tool
/// stores the checksum metadata tags here.
pub const APP_DATA_OFFSET: u64 = 0x8373;
pub const APP_DATA_LENGTH: usize = 0x200;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Inconsistent volume space size fields: {little} != {big}")]
    InconsistentVolumeSize { little: u64, big: u64 },
    #[error("Application id is not printable text")]
    InvalidAppId,
    #[error("Application data area is not printable text")]
    InvalidAppData,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Verification metadata for one image, assembled from the volume descriptor
/// and the embedded tag list. Immutable for the duration of one verification
/// pass.
#[derive(Clone, Debug)]
pub struct MediaImage {
    pub block_size: u32,
    /// Full image size in blocks.
    pub full_blocks: u64,
    /// Filesystem size in blocks, as declared by the volume descriptor.
    pub iso_blocks: u64,
    /// Trailing padding blocks. Excluded from the filesystem region and
    /// replaced by synthesized zero blocks when hashing.
    pub pad_blocks: u64,
    /// Trailing blocks excluded from the filesystem region without
    /// replacement.
    pub skip_blocks: u64,
    /// Installable partition sub-region.
    pub part_start: u64,
    pub part_blocks: u64,
    pub app_id: String,
    /// Ordered tag list recovered from the application data area.
    pub tags: Vec<Tag>,
    /// Reference digest over the filesystem region, as a hex string.
    pub iso_reference: Option<String>,
    /// Reference digest over the partition region, as a hex string.
    pub part_reference: Option<String>,
    /// Number of fragment checkpoints. Zero disables fragment checking.
    pub fragment_count: u32,
    /// Reference fragment checksum string.
    pub fragment_sums: String,
    pub signature: Option<SignatureInfo>,
}

impl MediaImage {
    /// Read the metadata fields from an image. The reader position afterwards
    /// is unspecified.
    pub fn from_reader(mut reader: impl Read + Seek) -> Result<Self> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        let block_size = BLOCK_SIZE;

        reader.seek(SeekFrom::Start(VOLUME_SIZE_OFFSET))?;
        let little_raw: [u8; 4] = reader.read_array_exact()?;
        let big_raw: [u8; 4] = reader.read_array_exact()?;

        let little = u64::from(u32::from_le_bytes(little_raw));
        let big = u64::from(u32::from_be_bytes(big_raw));
        if little == 0 || little != big {
            return Err(Error::InconsistentVolumeSize { little, big });
        }

        reader.seek(SeekFrom::Start(APP_ID_OFFSET))?;
        let app_id_raw = reader.read_vec_exact(APP_ID_LENGTH)?;
        let mut app_id = tags::sanitize_info(&app_id_raw).ok_or(Error::InvalidAppId)?;

        // Generic mastering tool ids carry no useful information.
        if app_id.starts_with("MKISOFS") || app_id.starts_with("GENISOIMAGE") {
            app_id.clear();
        }
        if let Some(pos) = app_id.rfind('#') {
            app_id.truncate(pos);
        }

        reader.seek(SeekFrom::Start(APP_DATA_OFFSET))?;
        let app_data_raw = reader.read_vec_exact(APP_DATA_LENGTH)?;
        let app_data = tags::sanitize_info(&app_data_raw).ok_or(Error::InvalidAppData)?;

        let mut media = Self {
            block_size,
            full_blocks: file_size / u64::from(block_size),
            iso_blocks: little * SECTOR_BLOCKS,
            pad_blocks: 0,
            skip_blocks: 0,
            part_start: 0,
            part_blocks: 0,
            app_id,
            tags: tags::parse(&app_data),
            iso_reference: None,
            part_reference: None,
            fragment_count: 0,
            fragment_sums: String::new(),
            signature: None,
        };

        let mut signature_block = None;

        for tag in &media.tags {
            debug!("Tag: {:?} = {:?}", tag.key, tag.value);

            let key = tag.key.to_ascii_lowercase();
            let value = tag.value.as_str();

            match key.as_str() {
                "md5sum" | "iso md5sum" | "sha1sum" | "sha224sum" | "sha256sum" | "sha384sum"
                | "sha512sum" => {
                    media.iso_reference = Some(value.to_owned());
                }
                "partition" => match parse_partition(value) {
                    Some((start, blocks, reference)) => {
                        media.part_start = start;
                        media.part_blocks = blocks;
                        media.part_reference = Some(reference);
                    }
                    None => warn!("Ignoring malformed partition tag: {value:?}"),
                },
                "pad" => match value.parse::<u64>() {
                    Ok(sectors) => media.pad_blocks = sectors * SECTOR_BLOCKS,
                    Err(_) => warn!("Ignoring malformed pad tag: {value:?}"),
                },
                "skip" => match value.parse::<u64>() {
                    Ok(sectors) => media.skip_blocks = sectors * SECTOR_BLOCKS,
                    Err(_) => warn!("Ignoring malformed skip tag: {value:?}"),
                },
                "fragment count" => match value.parse::<u32>() {
                    Ok(count) => media.fragment_count = count,
                    Err(_) => warn!("Ignoring malformed fragment count tag: {value:?}"),
                },
                "fragment sums" => media.fragment_sums = value.to_owned(),
                "signature" => match value.parse::<u64>() {
                    Ok(block) => signature_block = Some(block),
                    Err(_) => warn!("Ignoring malformed signature tag: {value:?}"),
                },
                _ => {}
            }
        }

        if let Some(block) = signature_block {
            media.signature = read_signature(&mut reader, block, &app_data_raw)?;
        }

        Ok(media)
    }
}

fn parse_partition(value: &str) -> Option<(u64, u64, String)> {
    let mut fields = value.splitn(3, ',');

    let start = fields.next()?.trim().parse().ok()?;
    let blocks = fields.next()?.trim().parse().ok()?;
    let reference = fields.next()?.trim();

    if reference.is_empty() {
        return None;
    }

    Some((start, blocks, reference.to_owned()))
}

/// Read and validate the signature block. A missing or malformed block leaves
/// the image unsigned rather than failing the whole check.
fn read_signature(
    mut reader: impl Read + Seek,
    block: u64,
    blob: &[u8],
) -> Result<Option<SignatureInfo>> {
    reader.seek(SeekFrom::Start(block * u64::from(BLOCK_SIZE)))?;

    let mut data = vec![0u8; SIGNATURE_BLOCK_SIZE];
    if reader.read_exact(&mut data).is_err() {
        warn!("Signature block {block} lies past the end of the image");
        return Ok(None);
    }

    if !data.starts_with(SIGNATURE_MAGIC) {
        warn!(
            "Invalid signature block magic: {:?}",
            data[..SIGNATURE_MAGIC.len()].as_bstr(),
        );
        return Ok(None);
    }

    let text = &data[SIGNATURE_MAGIC_SIZE..];
    if util::is_zero(text) {
        warn!("Signature block {block} contains no signature");
        return Ok(None);
    }

    let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
    let signature = String::from_utf8_lossy(&text[..end]).into_owned();
    if signature.trim().is_empty() {
        warn!("Signature block {block} contains no signature");
        return Ok(None);
    }

    Ok(Some(SignatureInfo {
        start_block: block,
        blob: blob.to_vec(),
        signature,
    }))
}
