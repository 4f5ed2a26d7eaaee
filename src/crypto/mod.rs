// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AEAD primitive (C2).
//!
//! The 128-bit block cipher and its CCM* mode are external collaborators
//! (§1) — provided here by the `aes`/`ccm` crates rather than hand-rolled —
//! this module is the thin seam the rest of the engine calls through, plus
//! the counter-based mutual-exclusion lock §5 and §9 require: the cipher
//! engine is process-wide shared state, not reentrant, and contention must
//! fail closed rather than block an interrupt handler.

mod lock;

pub use lock::CipherLock;

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U16, U4, U8};
use ccm::Ccm;
use cipher::BlockEncrypt;

use crate::error::{Error, Result};

/// Symmetric key length in bytes (pairwise, group, and `potr` keys alike).
pub const KEY_LEN: usize = 16;

/// A raw 128-bit symmetric key.
pub type Key = [u8; KEY_LEN];

/// CCM* nonce length per IEEE 802.15.4 (source address, frame counter,
/// security level byte).
pub const NONCE_LEN: usize = 13;

/// A CCM* nonce.
pub type Nonce = [u8; NONCE_LEN];

type CcmMic4 = Ccm<Aes128, U4, U13>;
type CcmMic8 = Ccm<Aes128, U8, U13>;
type CcmMic16 = Ccm<Aes128, U16, U13>;

/// One-shot AES-128 single-block encryption, XOR of `a` with `b`, and CCM*
/// authenticated encryption with a detached tag, sized to the three MIC
/// lengths the external interface recognizes (4, 8, 16 bytes).
///
/// There is no internal key schedule cache: each call constructs a fresh
/// cipher instance from the caller-supplied key. Key material itself is
/// never stored longer than the call that needs it; callers own zeroizing
/// their own key buffers (see [`crate::akes`] and [`crate::nbr`]).
pub struct Aead;

impl Aead {
    /// Encrypt a single 16-byte block under `key` (ECB, one block).
    ///
    /// This is the primitive the OTP framer (C5) uses directly: the normal
    /// and special OTP constructions are *not* AEAD operations, they are a
    /// bare block-cipher encryption of a context block, truncated to the
    /// low-order bytes of the result.
    #[must_use]
    pub fn encrypt_block(key: &Key, block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut out = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut out);
        out.into()
    }

    /// Authenticated encryption in place with a detached tag.
    ///
    /// `mic_len` must be 4, 8, or 16; any other value is a configuration
    /// bug in the caller and returns [`Error::BadKeyMaterial`].
    pub fn encrypt_detached(
        key: &Key,
        nonce: &Nonce,
        aad: &[u8],
        buffer: &mut [u8],
        mic_len: usize,
    ) -> Result<heapless::Vec<u8, 16>> {
        let nonce = GenericArray::from_slice(nonce);
        let mut out: heapless::Vec<u8, 16> = heapless::Vec::new();
        match mic_len {
            4 => {
                let cipher = CcmMic4::new(GenericArray::from_slice(key));
                let tag = cipher
                    .encrypt_in_place_detached(nonce, aad, buffer)
                    .map_err(|_| Error::BadKeyMaterial)?;
                out.extend_from_slice(tag.as_slice()).map_err(|()| Error::BadKeyMaterial)?;
            }
            8 => {
                let cipher = CcmMic8::new(GenericArray::from_slice(key));
                let tag = cipher
                    .encrypt_in_place_detached(nonce, aad, buffer)
                    .map_err(|_| Error::BadKeyMaterial)?;
                out.extend_from_slice(tag.as_slice()).map_err(|()| Error::BadKeyMaterial)?;
            }
            16 => {
                let cipher = CcmMic16::new(GenericArray::from_slice(key));
                let tag = cipher
                    .encrypt_in_place_detached(nonce, aad, buffer)
                    .map_err(|_| Error::BadKeyMaterial)?;
                out.extend_from_slice(tag.as_slice()).map_err(|()| Error::BadKeyMaterial)?;
            }
            _ => return Err(Error::BadKeyMaterial),
        };
        Ok(out)
    }

    /// Authenticated decryption in place given a detached tag.
    ///
    /// Returns `Ok(())` only if the tag verifies; `buffer` is left
    /// decrypted in place on success and must be discarded by the caller
    /// on failure (it may contain partially-transformed bytes).
    pub fn decrypt_detached(
        key: &Key,
        nonce: &Nonce,
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8],
    ) -> Result<()> {
        let nonce = GenericArray::from_slice(nonce);
        match tag.len() {
            4 => {
                let cipher = CcmMic4::new(GenericArray::from_slice(key));
                cipher
                    .decrypt_in_place_detached(nonce, aad, buffer, GenericArray::from_slice(tag))
                    .map_err(|_| Error::BadKeyMaterial)
            }
            8 => {
                let cipher = CcmMic8::new(GenericArray::from_slice(key));
                cipher
                    .decrypt_in_place_detached(nonce, aad, buffer, GenericArray::from_slice(tag))
                    .map_err(|_| Error::BadKeyMaterial)
            }
            16 => {
                let cipher = CcmMic16::new(GenericArray::from_slice(key));
                cipher
                    .decrypt_in_place_detached(nonce, aad, buffer, GenericArray::from_slice(tag))
                    .map_err(|_| Error::BadKeyMaterial)
            }
            _ => Err(Error::BadKeyMaterial),
        }
    }

    /// XOR two keys together, used to derive the normal-OTP key
    /// `peer_group_key ⊕ potr_key` (§4.1).
    #[must_use]
    pub fn xor_keys(a: &Key, b: &Key) -> Key {
        let mut out = [0u8; KEY_LEN];
        for i in 0..KEY_LEN {
            out[i] = a[i] ^ b[i];
        }
        out
    }
}
