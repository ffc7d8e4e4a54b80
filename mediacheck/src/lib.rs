/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! mediacheck is primarily an application and not a library. The Rust APIs can
//! change at any time, even in patch releases.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod cli;
pub mod digest;
pub mod format;
pub mod region;
pub mod sign;
pub mod stream;
pub mod util;
pub mod verify;
