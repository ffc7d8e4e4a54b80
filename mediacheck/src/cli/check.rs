/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{
    cli::warning,
    format::iso::MediaImage,
    sign::{GpgVerifier, SignState},
    verify::{RegionKind, Verifier},
};

fn print_media_info(media: &MediaImage) {
    if media.app_id.is_empty() {
        println!("app: unknown");
    } else {
        println!("app: {}", media.app_id);
    }

    let block_size = u64::from(media.block_size);

    println!("iso size: {} MiB", media.iso_blocks * block_size >> 20);
    if media.pad_blocks > 0 {
        println!("pad: {} MiB", media.pad_blocks * block_size >> 20);
    }
    if media.skip_blocks > 0 {
        println!("skip: {} MiB", media.skip_blocks * block_size >> 20);
    }
    if media.part_blocks > 0 {
        println!(
            "partition: first block {}, {} blocks",
            media.part_start, media.part_blocks,
        );
    }
    if media.fragment_count > 0 {
        println!("fragments: {}", media.fragment_count);
    }
}

/// Returns whether the region digest matched, or `None` for a region that
/// carries no reference digest and thus was never checked.
fn print_region_result(verifier: &mut Verifier, kind: RegionKind, verbose: bool) -> Option<bool> {
    if !verifier.digest(kind).has_reference() {
        return None;
    }

    let digest = verifier.digest_mut(kind);
    let name = digest.name();
    let ok = digest.is_ok();
    let valid = digest.is_valid();

    let result = if !valid {
        "not checked"
    } else if ok {
        "ok"
    } else {
        "wrong"
    };

    println!("{kind} {name}: {result}");

    if verbose {
        println!("  reference: {}", digest.hex_reference());
        if valid {
            println!("  computed:  {}", digest.hex());
        }
    }

    Some(valid && ok)
}

pub fn check_main(cli: &CheckCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut file = File::open(&cli.input)
        .with_context(|| format!("Failed to open file: {:?}", cli.input))?;

    let media = MediaImage::from_reader(&mut file)
        .with_context(|| format!("Failed to read media metadata: {:?}", cli.input))?;

    print_media_info(&media);

    if media.iso_reference.is_none() && media.part_reference.is_none() {
        bail!("Media contains no reference digests");
    }

    let mut verifier = Verifier::new(media).context("Failed to set up verification")?;

    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("Failed to seek file: {:?}", cli.input))?;

    let quiet = cli.quiet;
    verifier.run(&mut file, cancel_signal, &mut |percent| {
        if !quiet {
            print!("\rchecking: {percent:3}%");
            let _ = io::stdout().flush();
        }

        false
    });
    if !quiet {
        println!();
    }

    if verifier.aborted() && verifier.failed_fragment().is_none() {
        bail!("Verification was cancelled");
    }

    verifier.check_signature(&GpgVerifier::new(cli.key_file.clone()));

    if let Some(failure) = verifier.read_failure() {
        warning!("Could not read block {}", failure.block);
    }

    if let Some(index) = verifier.failed_fragment() {
        warning!(
            "Fragment {} of {} does not match",
            index + 1,
            verifier.media().fragment_count,
        );
    }

    // The media counts as verified when at least one checked region digest
    // matches. Any hard failure above has already invalidated every digest.
    let mut ok = false;
    for kind in [RegionKind::Filesystem, RegionKind::Partition] {
        if let Some(matched) = print_region_result(&mut verifier, kind, cli.verbose) {
            ok |= matched;
        }
    }

    {
        let digest = verifier.digest_mut(RegionKind::Full);
        if digest.algorithm().is_some() && digest.is_valid() {
            println!("{} of the whole image: {}", digest.name(), digest.hex());
        }
    }

    if verifier.sign_state() != SignState::NotSigned {
        println!("signature: {}", verifier.sign_state());
        if let Some(signer) = verifier.signed_by() {
            println!("signed by: {signer}");
        }
    }

    if !ok {
        bail!("Media verification failed");
    }

    Ok(())
}

/// Verify the reference digests embedded in an installation media image.
#[derive(Debug, Parser)]
pub struct CheckCli {
    /// Path to media image or block device.
    #[arg(value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to gpg keyring for signature verification.
    #[arg(long, value_name = "FILE", value_parser)]
    pub key_file: Option<PathBuf>,

    /// Print reference and computed digest values.
    #[arg(short, long)]
    pub verbose: bool,

    /// Do not display progress.
    #[arg(short, long)]
    pub quiet: bool,
}
