// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem, str};

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha224, Sha256, Sha384, Sha512};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Digest algorithm not supported: {0:?}")]
    UnknownAlgorithm(String),
    #[error("No digest algorithm or reference value specified")]
    Unspecified,
    #[error("Reference value length ({0} hex digits) matches no known digest")]
    UnknownReferenceSize(usize),
    #[error("Digest algorithm {name} does not match reference value length for {inferred}")]
    AlgorithmMismatch {
        name: DigestAlgorithm,
        inferred: DigestAlgorithm,
    },
    #[error("Invalid hex reference value")]
    InvalidHex(#[from] hex::FromHexError),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [Self; 6] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Binary digest size in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }

    /// Infer the algorithm from a binary digest size. Every supported
    /// algorithm has a distinct output size, so this is unambiguous.
    pub fn from_digest_size(size: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.digest_size() == size)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl str::FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::UnknownAlgorithm(s.to_owned()))
    }
}

#[derive(Clone)]
enum Context {
    None,
    Md5(Md5),
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Context {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Self::Md5(Md5::new()),
            DigestAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            DigestAlgorithm::Sha224 => Self::Sha224(Sha224::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha384 => Self::Sha384(Sha384::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        match self {
            Self::None => {}
            Self::Md5(c) => c.update(buf),
            Self::Sha1(c) => c.update(buf),
            Self::Sha224(c) => c.update(buf),
            Self::Sha256(c) => c.update(buf),
            Self::Sha384(c) => c.update(buf),
            Self::Sha512(c) => c.update(buf),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Md5(c) => c.finalize().to_vec(),
            Self::Sha1(c) => c.finalize().to_vec(),
            Self::Sha224(c) => c.finalize().to_vec(),
            Self::Sha256(c) => c.finalize().to_vec(),
            Self::Sha384(c) => c.finalize().to_vec(),
            Self::Sha512(c) => c.finalize().to_vec(),
        }
    }
}

/// A streaming digest accumulator with an optional reference value to compare
/// the final digest against.
///
/// The running hash state is duplicable: cloning an instance mid-stream yields
/// an independent accumulator that can be finalized without disturbing the
/// original. The incremental fragment checks rely on this.
#[derive(Clone)]
pub struct MediaDigest {
    algorithm: Option<DigestAlgorithm>,
    ctx: Context,
    result: Option<Vec<u8>>,
    reference: Option<Vec<u8>>,
    valid: bool,
    ok: bool,
}

impl fmt::Debug for MediaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaDigest")
            .field("algorithm", &self.algorithm)
            .field("finalized", &self.result.is_some())
            .field("valid", &self.valid)
            .field("ok", &self.ok)
            .finish_non_exhaustive()
    }
}

impl MediaDigest {
    /// Create a digest from an algorithm name, a hex reference value, or both.
    /// A missing name is inferred from the reference value length. If both are
    /// given, they must agree.
    pub fn new(name: Option<&str>, reference_hex: Option<&str>) -> Result<Self> {
        let by_name = match name {
            Some(n) => Some(
                DigestAlgorithm::from_name(n)
                    .ok_or_else(|| Error::UnknownAlgorithm(n.to_owned()))?,
            ),
            None => None,
        };

        let reference = reference_hex.map(hex::decode).transpose()?;
        let by_size = match &reference {
            Some(r) => Some(
                DigestAlgorithm::from_digest_size(r.len())
                    .ok_or(Error::UnknownReferenceSize(r.len() * 2))?,
            ),
            None => None,
        };

        let algorithm = match (by_name, by_size) {
            (Some(n), Some(s)) if n != s => {
                return Err(Error::AlgorithmMismatch {
                    name: n,
                    inferred: s,
                });
            }
            (Some(n), _) => n,
            (None, Some(s)) => s,
            (None, None) => return Err(Error::Unspecified),
        };

        Ok(Self {
            algorithm: Some(algorithm),
            ctx: Context::new(algorithm),
            result: None,
            reference,
            valid: true,
            ok: false,
        })
    }

    pub fn from_algorithm(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm: Some(algorithm),
            ctx: Context::new(algorithm),
            result: None,
            reference: None,
            valid: true,
            ok: false,
        }
    }

    /// An inert digest. It accepts and ignores input, never becomes valid, and
    /// reports empty name and hex strings.
    pub fn none() -> Self {
        Self {
            algorithm: None,
            ctx: Context::None,
            result: None,
            reference: None,
            valid: false,
            ok: false,
        }
    }

    pub fn algorithm(&self) -> Option<DigestAlgorithm> {
        self.algorithm
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Feed data into the running hash. Once the digest has been finalized,
    /// further input is ignored.
    pub fn process(&mut self, buf: &[u8]) {
        if self.result.is_none() {
            self.ctx.update(buf);
        }
    }

    /// Compute the final digest. Idempotent: repeated calls keep the first
    /// result. The match flag is only set when a reference value was supplied.
    pub fn finalize(&mut self) {
        if self.result.is_some() {
            return;
        }

        let ctx = mem::replace(&mut self.ctx, Context::None);
        let data = ctx.finalize();

        self.ok = match &self.reference {
            Some(r) => *r == data,
            None => false,
        };
        self.result = Some(data);
    }

    /// Whether the digest data can be trusted. Cleared when the verification
    /// pass fails or is aborted.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether the computed digest matches the reference value. Implicitly
    /// finalizes the digest.
    pub fn is_ok(&mut self) -> bool {
        self.finalize();
        self.ok
    }

    pub fn name(&self) -> &'static str {
        self.algorithm.map_or("", |a| a.name())
    }

    /// Computed digest as a hex string. Implicitly finalizes the digest.
    pub fn hex(&mut self) -> String {
        self.finalize();

        if self.algorithm.is_none() {
            return String::new();
        }

        hex::encode(self.result.as_deref().unwrap_or_default())
    }

    /// Reference digest as a hex string, or an empty string if no reference
    /// value was supplied.
    pub fn hex_reference(&self) -> String {
        self.reference.as_deref().map(hex::encode).unwrap_or_default()
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        self.ok = false;
    }
}
