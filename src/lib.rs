// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # llsec - secure link-layer engine for duty-cycled mesh radios
//!
//! A `no_std` Rust implementation of an authenticated, low-power
//! link-layer security stack for 802.15.4-style mesh nodes: key
//! establishment between neighbors, per-frame replay and forgery
//! rejection ahead of full decryption, and a duty-cycle / strobe engine
//! that lets a receiver tell a real frame from noise within a handful of
//! buffered bytes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use llsec::config::Config;
//! use llsec::nbr::NeighborTable;
//!
//! fn main() -> llsec::Result<()> {
//!     let config = Config::builder()
//!         .wake_interval_ticks(500)
//!         .max_neighbors(16)
//!         .build()?;
//!     let _table = NeighborTable::new(&config)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                     Upper layer (out of scope)                      |
//! +---------------------------------------------------------------------+
//! |  C3 handshake (akes)  |  C4 neighbor table (nbr)  |  C6 replay       |
//! |  HELLO/HELLOACK/ACK FSM, pairwise-key derivation    ledger           |
//! +---------------------------------------------------------------------+
//! |  C5 OTP framer (otp)  --  C8 framer chain (framer)                  |
//! |  compact header create/validate, composed with the PHY stage        |
//! +---------------------------------------------------------------------+
//! |  C2 crypto (crypto)           |  C7 duty cycle / strobe (sde)       |
//! |  CCM* AEAD, counter-based lock |  wake state machine, authenticated |
//! |                                 |  acks, phase-lock tracking        |
//! +---------------------------------------------------------------------+
//! |                 C1 radio seam (radio) -- platform driver            |
//! +---------------------------------------------------------------------+
//! |         [`engine`] -- ties C1/C4/C6/C7/C8 together                  |
//! +---------------------------------------------------------------------+
//! ```
//!
//! Inbound frames flow bottom-up through this stack; only once the OTP
//! framer (C5) has authenticated a header do bytes become visible to the
//! handshake or replay logic above it (§4.6 in the design notes this
//! crate was built from). Outbound frames flow top-down, in the reverse
//! order. [`engine`] is the piece that actually owns one of each
//! component and drives this data flow off real radio/timer events,
//! rather than the caller threading a frame through each stage by hand.
//!
//! ## Modules
//!
//! - [`config`] - compile-/run-time tunables and the security-level
//!   encoding shared by the whole stack
//! - [`addr`] - fixed-capacity link-layer addresses
//! - [`radio`] - the seam a platform radio driver is wired in through
//! - [`crypto`] - CCM* AEAD primitives and the non-blocking cipher lock
//! - [`replay`] - per-neighbor anti-replay ledgers
//! - [`nbr`] - the neighbor table and its tentative/permanent records
//! - [`otp`] - the compact, pre-authentication frame header
//! - [`akes`] - the three-way key-establishment handshake
//! - [`sde`] - the duty-cycle and strobe state machines, authenticated acks
//! - [`framer`] - glue sequencing the OTP framer against a PHY framer
//! - [`engine`] - owns one of each component and drives them off radio
//!   and timer events
//!
//! ## Non-goals
//!
//! This crate does not implement a radio driver, a cryptographically
//! secure random number generator, routing, or fragmentation — see each
//! module's docs for the specific seam it expects a platform integration
//! to fill.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Fixed-capacity link-layer addresses (§3).
pub mod addr;
/// Key establishment handshake (C3).
pub mod akes;
/// Run-time configuration and the security-level encoding (§6).
pub mod config;
/// CCM* AEAD primitives and the non-blocking cipher lock (C2).
pub mod crypto;
/// Crate-wide error and outcome types.
pub mod error;
/// Glue sequencing the OTP framer against a PHY framer (C8).
pub mod framer;
/// Wires the radio, handshake, table, and framer chain together.
pub mod engine;
/// Neighbor table and handshake records (C4).
pub mod nbr;
/// Compact, pre-authentication frame header (C5).
pub mod otp;
/// Per-neighbor anti-replay ledgers (C6).
pub mod replay;
/// The seam a platform radio driver is wired in through (C1).
pub mod radio;
/// Duty-cycle and strobe state machines, authenticated acks (C7).
pub mod sde;

pub use error::{Error, Result, TxOutcome};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
