// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, fs,
    io::{self},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::debug;

/// Size of the on-disk signature block.
pub const SIGNATURE_BLOCK_SIZE: usize = 0x800;
/// Size of the magic prefix at the start of the signature block. Only this
/// prefix survives normalization; the remainder of the block is zeroed before
/// the filesystem digests are computed.
pub const SIGNATURE_MAGIC_SIZE: usize = 0x40;
/// Marker at the start of the magic prefix. The rest of the prefix is padding.
pub const SIGNATURE_MAGIC: &[u8] = b"mediacheck signature v1\n";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create temporary directory")]
    TempDir(#[source] io::Error),
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(String, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle of the embedded detached signature. Transitions only move
/// forward: `NotSigned` -> `NotChecked` -> one of the three verdicts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SignState {
    #[default]
    NotSigned,
    NotChecked,
    Ok,
    Bad,
    BadNoMatchingKey,
}

impl SignState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSigned => "not signed",
            Self::NotChecked => "not checked",
            Self::Ok => "ok",
            Self::Bad => "bad",
            Self::BadNoMatchingKey => "bad (no matching key)",
        }
    }

    /// Whether `next` is a legal forward transition from the current state.
    pub fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::NotSigned => next == Self::NotChecked,
            Self::NotChecked => {
                matches!(next, Self::Ok | Self::Bad | Self::BadNoMatchingKey)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A syntactically valid signature block found in the image, together with the
/// raw metadata bytes the signature covers.
#[derive(Clone)]
pub struct SignatureInfo {
    /// Block offset of the signature block within the image.
    pub start_block: u64,
    /// Raw application data area bytes the detached signature applies to.
    pub blob: Vec<u8>,
    /// Armored detached signature text.
    pub signature: String,
}

impl fmt::Debug for SignatureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureInfo")
            .field("start_block", &self.start_block)
            .field("blob_len", &self.blob.len())
            .field("signature_len", &self.signature.len())
            .finish_non_exhaustive()
    }
}

/// Verdict produced by the external signature verifier.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Good { signer: String },
    Bad,
    NoMatchingKey,
}

/// External collaborator that checks a detached signature over raw bytes. The
/// verification pass only depends on this trait; process spawning and key
/// management stay behind it.
pub trait SignatureVerifier {
    fn verify(&self, blob: &[u8], signature: &str) -> Result<Verdict>;
}

/// Signature verifier backed by `gpgv`. The blob and signature are written to
/// a temporary directory and the verdict is parsed from gpgv's machine
/// readable status output.
pub struct GpgVerifier {
    keyring: Option<PathBuf>,
}

impl GpgVerifier {
    pub fn new(keyring: Option<PathBuf>) -> Self {
        Self { keyring }
    }
}

impl SignatureVerifier for GpgVerifier {
    fn verify(&self, blob: &[u8], signature: &str) -> Result<Verdict> {
        let temp_dir = tempfile::tempdir().map_err(Error::TempDir)?;

        let signature_path = temp_dir.path().join("media.asc");
        let blob_path = temp_dir.path().join("media.blob");

        write_file(&signature_path, signature.as_bytes())?;
        write_file(&blob_path, blob)?;

        let mut command = Command::new("gpgv");
        command.args(["--status-fd", "1"]);
        if let Some(keyring) = &self.keyring {
            command.arg("--keyring").arg(keyring);
        }
        command.arg(&signature_path).arg(&blob_path);
        command.stdin(Stdio::null());

        let output = command
            .output()
            .map_err(|e| Error::CommandSpawn(format!("{command:?}"), e))?;

        debug!("gpgv status output: {:?}", output.stdout.as_bstr());
        debug!("gpgv log output: {:?}", output.stderr.as_bstr());

        Ok(parse_gpgv_status(&output.stdout))
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|e| Error::WriteFile(path.to_owned(), e))
}

/// Map gpgv `--status-fd` output to a verdict. Anything that is not an
/// explicit good signature is bad.
fn parse_gpgv_status(stdout: &[u8]) -> Verdict {
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix(b"[GNUPG:] ") else {
            continue;
        };

        let mut fields = rest.split_str(" ");
        match fields.next() {
            Some(b"GOODSIG") => {
                // The key ID follows the keyword; the remainder is the user ID.
                fields.next();

                let signer = fields.collect::<Vec<_>>().join(&b" "[..]);

                return Verdict::Good {
                    signer: String::from_utf8_lossy(&signer).into_owned(),
                };
            }
            Some(b"BADSIG") => return Verdict::Bad,
            Some(b"NO_PUBKEY") => return Verdict::NoMatchingKey,
            _ => {}
        }
    }

    Verdict::Bad
}
