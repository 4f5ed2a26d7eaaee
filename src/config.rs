// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! Provides a fluent builder over the knobs the external interface
//! recognizes, with the same defaults the source ships.

use crate::error::{Error, Result};

/// Security level, IEEE 802.15.4 style three-bit encoding.
///
/// The low two bits select the MIC length (4/8/16 bytes, encoded as 6/8/10
/// after CCM* framing overhead); the high bit adds encryption on top of
/// authentication. `MIC_32` (would decode to a 6-byte encoded length with
/// no high bit) is not a distinct level here: length 4 already encodes to 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecLevel {
    /// Authentication only, 4-byte MIC (6 bytes on the wire).
    Mic32,
    /// Authentication only, 8-byte MIC (8 bytes on the wire).
    Mic64,
    /// Authentication only, 16-byte MIC (10 bytes on the wire).
    Mic128,
    /// Encryption plus 4-byte MIC.
    EncMic32,
    /// Encryption plus 8-byte MIC.
    EncMic64,
    /// Encryption plus 16-byte MIC.
    EncMic128,
}

impl SecLevel {
    /// MIC length in bytes as produced by the AEAD primitive.
    #[must_use]
    pub fn mic_len(self) -> usize {
        match self {
            Self::Mic32 | Self::EncMic32 => 4,
            Self::Mic64 | Self::EncMic64 => 8,
            Self::Mic128 | Self::EncMic128 => 16,
        }
    }

    /// Length of the MIC field the external-interface table documents for
    /// an acknowledgement frame (6/8/10 bytes). The AEAD backend this
    /// crate uses only produces the three standard CCM* tag sizes (4, 8,
    /// 16), so [`Self::mic_len`] is what actually sizes the wire's `mic`
    /// field end to end; this accessor exists so code that needs to talk
    /// about the originally documented encoding still can.
    #[must_use]
    pub fn encoded_ack_mic_len(self) -> usize {
        match self.mic_len() {
            4 => 6,
            8 => 8,
            16 => 10,
            _ => unreachable!("mic_len only returns 4, 8, or 16"),
        }
    }

    /// True when this level also requires payload encryption.
    #[must_use]
    pub fn encrypts(self) -> bool {
        matches!(self, Self::EncMic32 | Self::EncMic64 | Self::EncMic128)
    }
}

/// Which phase-lock construction the strobe engine uses (§4.5.3, §9.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseLockMode {
    /// Phase is learned only from an authenticated (CCM*-tagged) ack.
    Secure,
    /// Phase is learned from the plain `delta` byte of any recognizable
    /// frame header, without requiring a MIC-bearing acknowledgement.
    Original,
}

/// Address width, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrWidth {
    /// 2-byte short address.
    Short,
    /// 8-byte extended address.
    Extended,
}

impl AddrWidth {
    #[must_use]
    pub fn len(self) -> usize {
        match self {
            Self::Short => 2,
            Self::Extended => 8,
        }
    }
}

/// Validated engine configuration.
///
/// All fields are immutable after construction, enforced by the builder
/// pattern below; a `Config` is cheap to clone and share across the radio,
/// table, and duty-cycle components that each need a read-only view of it.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr_width: AddrWidth,
    pub max_tentatives: u8,
    pub max_neighbors: u8,
    pub key_len: u8,
    pub with_pairwise_keys: bool,
    pub with_group_keys: bool,
    pub with_indices: bool,
    pub unicast_sec_level: SecLevel,
    pub broadcast_sec_level: SecLevel,
    pub wake_interval_ticks: u32,
    pub lifetime_secs: u32,
    pub otp_len: u8,
    pub phase_lock_mode: PhaseLockMode,
    pub update_threshold_secs: u32,
}

impl Config {
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug)]
pub struct ConfigBuilder {
    addr_width: AddrWidth,
    max_tentatives: u8,
    max_neighbors: Option<u8>,
    key_len: u8,
    with_pairwise_keys: bool,
    with_group_keys: bool,
    with_indices: bool,
    unicast_sec_level: SecLevel,
    broadcast_sec_level: SecLevel,
    wake_interval_ticks: u32,
    lifetime_secs: u32,
    otp_len: u8,
    phase_lock_mode: PhaseLockMode,
    update_threshold_secs: u32,
}

/// Hard upper bound on concurrent tentative handshakes (§3.1): the
/// configuration surface validates against this, it does not grow it.
pub const AKES_NBR_MAX_TENTATIVES: u8 = 5;
/// Fixed key length in bytes (§3.1).
pub const AKES_NBR_KEY_LEN: u8 = 16;
/// Fixed challenge length in bytes (§3.1).
pub const AKES_NBR_CHALLENGE_LEN: usize = 8;

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            addr_width: AddrWidth::Short,
            max_tentatives: AKES_NBR_MAX_TENTATIVES,
            max_neighbors: None,
            key_len: AKES_NBR_KEY_LEN,
            with_pairwise_keys: true,
            with_group_keys: true,
            with_indices: true,
            unicast_sec_level: SecLevel::EncMic64,
            broadcast_sec_level: SecLevel::Mic32,
            wake_interval_ticks: 0,
            lifetime_secs: 3600,
            otp_len: 3,
            phase_lock_mode: PhaseLockMode::Secure,
            update_threshold_secs: 300,
        }
    }
}

impl ConfigBuilder {
    #[must_use]
    pub fn addr_width(mut self, width: AddrWidth) -> Self {
        self.addr_width = width;
        self
    }

    #[must_use]
    pub fn max_tentatives(mut self, max: u8) -> Self {
        self.max_tentatives = max;
        self
    }

    #[must_use]
    pub fn max_neighbors(mut self, max: u8) -> Self {
        self.max_neighbors = Some(max);
        self
    }

    #[must_use]
    pub fn with_pairwise_keys(mut self, enabled: bool) -> Self {
        self.with_pairwise_keys = enabled;
        self
    }

    #[must_use]
    pub fn with_group_keys(mut self, enabled: bool) -> Self {
        self.with_group_keys = enabled;
        self
    }

    #[must_use]
    pub fn with_indices(mut self, enabled: bool) -> Self {
        self.with_indices = enabled;
        self
    }

    #[must_use]
    pub fn unicast_sec_level(mut self, level: SecLevel) -> Self {
        self.unicast_sec_level = level;
        self
    }

    #[must_use]
    pub fn broadcast_sec_level(mut self, level: SecLevel) -> Self {
        self.broadcast_sec_level = level;
        self
    }

    #[must_use]
    pub fn wake_interval_ticks(mut self, ticks: u32) -> Self {
        self.wake_interval_ticks = ticks;
        self
    }

    #[must_use]
    pub fn lifetime_secs(mut self, secs: u32) -> Self {
        self.lifetime_secs = secs;
        self
    }

    #[must_use]
    pub fn phase_lock_mode(mut self, mode: PhaseLockMode) -> Self {
        self.phase_lock_mode = mode;
        self
    }

    #[must_use]
    pub fn update_threshold_secs(mut self, secs: u32) -> Self {
        self.update_threshold_secs = secs;
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_tentatives` exceeds the
    /// compiled-in bound, if neither key kind is enabled, or if
    /// `wake_interval_ticks` is zero (a zero interval cannot be scheduled).
    pub fn build(self) -> Result<Config> {
        if self.max_tentatives > AKES_NBR_MAX_TENTATIVES {
            return Err(Error::InvalidConfig("max_tentatives exceeds compiled-in bound"));
        }
        if !self.with_pairwise_keys && !self.with_group_keys {
            return Err(Error::InvalidConfig(
                "at least one of with_pairwise_keys/with_group_keys must be enabled",
            ));
        }
        if self.wake_interval_ticks == 0 {
            return Err(Error::InvalidConfig("wake_interval_ticks must be nonzero"));
        }
        let addr_len = self.addr_width.len() as u8;
        let default_max_neighbors = 127u8
            .saturating_sub(11)
            .saturating_sub(addr_len)
            .saturating_sub(self.broadcast_sec_level.mic_len() as u8);
        Ok(Config {
            addr_width: self.addr_width,
            max_tentatives: self.max_tentatives,
            max_neighbors: self.max_neighbors.unwrap_or(default_max_neighbors),
            key_len: self.key_len,
            with_pairwise_keys: self.with_pairwise_keys,
            with_group_keys: self.with_group_keys,
            with_indices: self.with_indices,
            unicast_sec_level: self.unicast_sec_level,
            broadcast_sec_level: self.broadcast_sec_level,
            wake_interval_ticks: self.wake_interval_ticks,
            lifetime_secs: self.lifetime_secs,
            otp_len: self.otp_len,
            phase_lock_mode: self.phase_lock_mode,
            update_threshold_secs: self.update_threshold_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        let config = Config::builder().wake_interval_ticks(512).build().unwrap();
        assert_eq!(config.max_tentatives, AKES_NBR_MAX_TENTATIVES);
        assert_eq!(config.lifetime_secs, 3600);
        assert_eq!(config.otp_len, 3);
    }

    #[test]
    fn rejects_too_many_tentatives() {
        let result = Config::builder()
            .max_tentatives(AKES_NBR_MAX_TENTATIVES + 1)
            .wake_interval_ticks(512)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_no_key_kind() {
        let result = Config::builder()
            .with_pairwise_keys(false)
            .with_group_keys(false)
            .wake_interval_ticks(512)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_wake_interval() {
        let result = Config::builder().wake_interval_ticks(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn sec_level_mic_lengths() {
        assert_eq!(SecLevel::Mic32.mic_len(), 4);
        assert_eq!(SecLevel::Mic64.encoded_ack_mic_len(), 8);
        assert!(SecLevel::EncMic128.encrypts());
        assert!(!SecLevel::Mic128.encrypts());
    }
}
