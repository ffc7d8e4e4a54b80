/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{BufReader, Read},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{digest::MediaDigest, stream, verify};

pub fn digest_main(cli: &DigestCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut digest = MediaDigest::new(Some(&cli.algorithm), cli.expected.as_deref())
        .with_context(|| format!("Invalid digest specification: {:?}", cli.algorithm))?;

    let mut reader = File::open(&cli.input)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open file: {:?}", cli.input))?;

    let mut buf = vec![0u8; verify::CHUNK_SIZE];

    loop {
        stream::check_cancel(cancel_signal)?;

        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read file: {:?}", cli.input))?;
        if n == 0 {
            break;
        }

        digest.process(&buf[..n]);
    }

    println!("{}  {}", digest.hex(), cli.input.display());

    if digest.has_reference() && !digest.is_ok() {
        bail!("Digest does not match the expected value");
    }

    Ok(())
}

/// Compute a plain digest over an entire file.
///
/// No region splitting or normalization is applied; the output matches the
/// corresponding coreutils tool.
#[derive(Debug, Parser)]
pub struct DigestCli {
    /// Path to input file.
    #[arg(value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Digest algorithm.
    #[arg(short, long, value_name = "NAME", default_value = "sha256")]
    pub algorithm: String,

    /// Expected digest as a hex string. The exit code reports a mismatch.
    #[arg(short, long, value_name = "HEX")]
    pub expected: Option<String>,
}
