// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OTP framer (C5).
//!
//! Builds and validates the compact frame header — the constant-sized
//! prefix a receiver can check before the rest of the frame has even
//! arrived in the FIFO. This is the hottest path in the engine: it decides,
//! on a handful of buffered bytes, whether to keep listening or flush and
//! go back to sleep.
//!
//! Frame type `8` (the acknowledgement frame, `type || delta || mic`) is a
//! different wire shape entirely and is not handled here; see
//! [`crate::sde`] for its construction and validation.

use heapless::Vec as HVec;
use zeroize::Zeroize;

use crate::addr::LinkAddr;
use crate::crypto::{Aead, Key};
use crate::nbr::{NeighborTable, TentativeStatus};
use crate::replay::Direction;

/// Length of the OTP field, bytes (§3.1, §6).
pub const OTP_LEN: usize = 3;

/// Upper bound on the HELLOACK OTP replay cache (§9.1): sized to the
/// compiled-in tentative-record cap, since that is the maximum number of
/// HELLOACKs that can be legitimately in flight at once.
const HELLO_ACK_CACHE_CAP: usize = crate::config::AKES_NBR_MAX_TENTATIVES as usize;

/// One of the nine frame type codes the header's first byte carries
/// (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    UnicastData = 0,
    UnicastCommand = 1,
    HelloAck = 2,
    HelloAckPairwise = 3,
    Ack = 4,
    BroadcastData = 5,
    BroadcastCommand = 6,
    Hello = 7,
    Acknowledgement = 8,
}

impl FrameType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::UnicastData,
            1 => Self::UnicastCommand,
            2 => Self::HelloAck,
            3 => Self::HelloAckPairwise,
            4 => Self::Ack,
            5 => Self::BroadcastData,
            6 => Self::BroadcastCommand,
            7 => Self::Hello,
            8 => Self::Acknowledgement,
            _ => return None,
        })
    }

    /// True for the three broadcast-routed types (§4.1): the derived
    /// receiver address is the broadcast sentinel, not this node.
    #[must_use]
    pub fn is_broadcast(self) -> bool {
        matches!(self, Self::BroadcastData | Self::BroadcastCommand | Self::Hello)
    }

    /// True for the five types that expect an acknowledgement and
    /// therefore carry a trailing strobe-index byte (§6).
    #[must_use]
    pub fn has_strobe_index(self) -> bool {
        matches!(
            self,
            Self::UnicastData | Self::UnicastCommand | Self::HelloAck | Self::HelloAckPairwise | Self::Ack
        )
    }
}

fn otp_block(first_field: &[u8], second_field: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..first_field.len()].copy_from_slice(first_field);
    let end = first_field.len() + second_field.len();
    block[first_field.len()..end].copy_from_slice(second_field);
    block
}

/// Normal OTP: `receiver_addr || counter(4) || zero_pad`, keyed by
/// `group_key ⊕ potr_key` (§4.1).
#[must_use]
pub fn normal_otp(potr_key: &Key, group_key: &Key, receiver: &[u8], counter: u32) -> [u8; 3] {
    let key = Aead::xor_keys(group_key, potr_key);
    let block = otp_block(receiver, &counter.to_be_bytes());
    let enc = Aead::encrypt_block(&key, &block);
    [enc[13], enc[14], enc[15]]
}

/// Special OTP: `peer_addr || challenge(8) || zero_pad`, keyed by
/// `potr_key` alone (§4.1).
#[must_use]
pub fn special_otp(potr_key: &Key, peer_addr: &[u8], challenge: &[u8; 8]) -> [u8; 3] {
    let block = otp_block(peer_addr, challenge);
    let enc = Aead::encrypt_block(potr_key, &block);
    [enc[13], enc[14], enc[15]]
}

/// Bounded, oldest-evicted cache of recently validated HELLOACK OTPs
/// (§4.1, §9.1), rejecting a HELLOACK replayed against a fresh sender.
struct HelloAckCache {
    entries: HVec<[u8; 3], HELLO_ACK_CACHE_CAP>,
}

impl HelloAckCache {
    fn new() -> Self {
        Self { entries: HVec::new() }
    }

    fn contains(&self, otp: &[u8; 3]) -> bool {
        self.entries.iter().any(|seen| seen == otp)
    }

    fn insert(&mut self, otp: [u8; 3]) {
        if self.entries.is_full() {
            self.entries.remove(0);
        }
        let _ = self.entries.push(otp);
    }
}

/// The key material a header's OTP field is derived from, selected by the
/// caller according to the frame type being created.
pub enum OtpContext<'a> {
    /// Unicast or broadcast data/command frame: normal OTP under the
    /// given group key and the frame's derived receiver address.
    Normal { receiver: LinkAddr, group_key: &'a Key },
    /// HELLO, HELLOACK, or ACK: special OTP under `potr_key` alone,
    /// binding to the peer address and in-flight challenge.
    Special { peer_addr: LinkAddr, challenge: [u8; 8] },
}

/// A header successfully validated through all eight steps of §4.1.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedFrame {
    pub frame_type: FrameType,
    pub src_addr: LinkAddr,
    pub counter: u32,
    /// The header's raw OTP field. Populated for every frame type, but
    /// only meaningful to a caller for `HelloAck`/`HelloAckPairwise`:
    /// this layer cannot authenticate those two itself (see
    /// [`OtpFramer::validate`]'s notes on the handshake's role
    /// asymmetry), so it hands the raw bytes up for the handshake engine
    /// to check against its own pending challenge.
    pub frame_otp: [u8; OTP_LEN],
    pub strobe_index: Option<u8>,
    /// Byte offset of the first payload byte after the header (and the
    /// trailing strobe index, if present).
    pub header_len: usize,
}

/// Builds and validates OTP headers for one engine instance.
///
/// Holds the two secrets a header's OTP depends on: `potr_key`, a
/// network-wide pre-shared secret distinct from the group key, used alone
/// or XORed into the normal-OTP key to authenticate handshake frames
/// before any per-peer record exists; and the network-wide `group_key`
/// used for ordinary broadcast traffic, including HELLO.
pub struct OtpFramer {
    potr_key: Key,
    group_key: Option<Key>,
    addr_len: usize,
    counter_len: usize,
    hello_ack_cache: HelloAckCache,
}

impl OtpFramer {
    #[must_use]
    pub fn new(potr_key: Key, group_key: Option<Key>, addr_len: usize, counter_len: usize) -> Self {
        Self {
            potr_key,
            group_key,
            addr_len,
            counter_len,
            hello_ack_cache: HelloAckCache::new(),
        }
    }

    /// Special OTP keyed by this framer's own `potr_key`, exposed for the
    /// handshake engine to precompute the OTP it expects on a later
    /// message in the HELLO/HELLOACK/ACK chain (§4.2).
    #[must_use]
    pub(crate) fn special_otp_self(&self, peer_addr: &[u8], challenge: &[u8; 8]) -> [u8; 3] {
        special_otp(&self.potr_key, peer_addr, challenge)
    }

    /// This framer's `potr_key`, exposed to the handshake engine for
    /// pairwise-key derivation (§4.2) — the only other in-crate consumer
    /// of the raw secret.
    #[must_use]
    pub(crate) fn potr_key(&self) -> &Key {
        &self.potr_key
    }

    /// The network-wide group key, exposed so the handshake engine can
    /// adopt it as a peer's record key when pairwise keys are disabled
    /// (§4.2, `with_pairwise_keys = false`).
    #[must_use]
    pub(crate) fn group_key(&self) -> Option<&Key> {
        self.group_key.as_ref()
    }

    /// Check `otp` against the HELLOACK replay cache (§9.1), recording it
    /// if new. Returns `false` if `otp` was already seen — a replayed
    /// HELLOACK.
    ///
    /// This check cannot live inside [`Self::validate`]: the node
    /// receiving a HELLOACK is the original HELLO sender, which holds no
    /// tentative record for the peer to derive the expected OTP from (the
    /// handshake's role asymmetry — see `DESIGN.md`). It is the handshake
    /// engine that independently recomputes the expected special OTP from
    /// its own pending challenge; once that match succeeds, it calls this
    /// to guard against a replayed HELLOACK.
    pub(crate) fn check_and_record_hello_ack_otp(&mut self, otp: [u8; OTP_LEN]) -> bool {
        if self.hello_ack_cache.contains(&otp) {
            return false;
        }
        self.hello_ack_cache.insert(otp);
        true
    }

    fn header_len(&self, frame_type: FrameType) -> usize {
        let fixed = 1 + self.addr_len + self.counter_len + OTP_LEN;
        fixed + usize::from(frame_type.has_strobe_index())
    }

    /// Write a complete header (and, for ack-expecting types, a zeroed
    /// strobe-index byte the caller fills in on each retransmission) into
    /// `out`. Returns the number of bytes written, or `None` if `out` is
    /// too small.
    pub fn create_header(
        &self,
        out: &mut [u8],
        frame_type: FrameType,
        src_addr: &LinkAddr,
        counter: u32,
        ctx: &OtpContext<'_>,
    ) -> Option<usize> {
        let len = self.header_len(frame_type);
        if out.len() < len {
            return None;
        }
        out[0] = frame_type as u8;
        out[1..1 + self.addr_len].copy_from_slice(src_addr.as_slice());
        let counter_bytes = counter.to_be_bytes();
        let counter_start = 1 + self.addr_len;
        out[counter_start..counter_start + self.counter_len]
            .copy_from_slice(&counter_bytes[4 - self.counter_len..]);
        let otp_start = counter_start + self.counter_len;
        let otp = match ctx {
            OtpContext::Normal { receiver, group_key } => {
                normal_otp(&self.potr_key, group_key, receiver.as_slice(), counter)
            }
            OtpContext::Special { peer_addr, challenge } => {
                special_otp(&self.potr_key, peer_addr.as_slice(), challenge)
            }
        };
        out[otp_start..otp_start + OTP_LEN].copy_from_slice(&otp);
        if frame_type.has_strobe_index() {
            out[otp_start + OTP_LEN] = 0;
        }
        Some(len)
    }

    /// Validate the header of an inbound frame already buffered up to
    /// (at least) the FIFOP threshold, following the eight-step order of
    /// §4.1 exactly. Returns `None` on any failure — per the crate's
    /// error taxonomy this is never surfaced as a typed error, only
    /// logged by the caller at `trace`/`debug` and the frame dropped.
    pub fn validate(
        &mut self,
        buf: &[u8],
        local_addr: &LinkAddr,
        table: &NeighborTable,
    ) -> Option<ValidatedFrame> {
        // 1. length sanity.
        let fixed_len = 1 + self.addr_len + self.counter_len + OTP_LEN;
        if buf.len() < fixed_len {
            log::trace!("otp header rejected: buffer shorter than fixed header length");
            return None;
        }
        let Some(frame_type) = FrameType::from_u8(buf[0]) else {
            log::trace!("otp header rejected: unrecognized frame type {}", buf[0]);
            return None;
        };
        if frame_type == FrameType::Acknowledgement {
            // Not this chain's wire shape; see crate::sde.
            return None;
        }

        // 2. derived receiver address.
        let receiver = if frame_type.is_broadcast() {
            LinkAddr::broadcast(self.addr_len)
        } else {
            *local_addr
        };

        // 3. source address lookup.
        let src_addr = LinkAddr::from_slice(&buf[1..1 + self.addr_len])?;
        let entry = table.get_by_sender_addr(&src_addr);

        // 4. counter parse.
        let counter_start = 1 + self.addr_len;
        let counter_end = counter_start + self.counter_len;
        let mut counter_bytes = [0u8; 4];
        counter_bytes[4 - self.counter_len..].copy_from_slice(&buf[counter_start..counter_end]);
        let counter = u32::from_be_bytes(counter_bytes);

        let otp_end = counter_end + OTP_LEN;
        let mut frame_otp = [0u8; 3];
        frame_otp.copy_from_slice(&buf[counter_end..otp_end]);

        match frame_type {
            FrameType::HelloAck | FrameType::HelloAckPairwise => {
                // 5. Structural only. This node is the original HELLO
                // sender: per the handshake's role asymmetry, it never
                // creates a tentative record for the peer that replies
                // with a HELLOACK (it goes straight to a permanent record
                // instead — see `DESIGN.md`), so there is nothing in
                // `table` to recompute the expected special OTP from. The
                // actual OTP match against this node's own pending
                // challenge, and the HELLOACK replay-cache check, happen
                // in `crate::akes::AkesEngine::handle_hello_ack` once it
                // has that pending-challenge state available.
            }
            FrameType::Ack => {
                // 6. check against the matching tentative record's cached OTP.
                let tentative = entry?.tentative.as_ref()?;
                if tentative.status != TentativeStatus::TentativeAwaitingAck {
                    log::debug!("otp header rejected: ack received outside awaiting-ack state");
                    return None;
                }
                if tentative.cached_otp != frame_otp {
                    log::debug!("otp header rejected: ack otp does not match cached value");
                    return None;
                }
            }
            _ => {
                // 7. recompute normal OTP.
                let direction = if frame_type.is_broadcast() {
                    Direction::Broadcast
                } else {
                    Direction::Unicast
                };
                let key = if frame_type.is_broadcast() {
                    self.group_key.as_ref()?
                } else {
                    let permanent = entry?.permanent.as_ref()?;
                    permanent.pairwise_key.as_ref().or(permanent.group_key.as_ref())?
                };
                let expected = normal_otp(&self.potr_key, key, receiver.as_slice(), counter);
                if expected != frame_otp {
                    log::debug!("otp header rejected: normal otp mismatch");
                    return None;
                }

                // 8. replay ledger.
                if let Some(permanent) = entry.and_then(|e| e.permanent.as_ref()) {
                    if permanent.replay.was_replayed(direction, counter) {
                        log::warn!("otp header rejected: counter {counter} already seen");
                        return None;
                    }
                }
            }
        }

        let strobe_index = if frame_type.has_strobe_index() {
            Some(*buf.get(otp_end)?)
        } else {
            None
        };
        let header_len = otp_end + usize::from(frame_type.has_strobe_index());

        Some(ValidatedFrame {
            frame_type,
            src_addr,
            counter,
            frame_otp,
            strobe_index,
            header_len,
        })
    }
}

impl Drop for OtpFramer {
    fn drop(&mut self) {
        self.potr_key.zeroize();
        if let Some(group_key) = self.group_key.as_mut() {
            group_key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn table() -> NeighborTable {
        let config = Config::builder().wake_interval_ticks(512).max_neighbors(8).build().unwrap();
        NeighborTable::new(&config).unwrap()
    }

    #[test]
    fn normal_otp_changes_with_any_input_l2() {
        let potr = [1u8; 16];
        let group = [2u8; 16];
        let base = normal_otp(&potr, &group, &[0xFF, 0xFF], 1);
        let diff_receiver = normal_otp(&potr, &group, &[0xFF, 0xFE], 1);
        let diff_counter = normal_otp(&potr, &group, &[0xFF, 0xFF], 2);
        let mut diff_group = group;
        diff_group[0] ^= 1;
        let diff_key = normal_otp(&potr, &diff_group, &[0xFF, 0xFF], 1);
        assert_ne!(base, diff_receiver);
        assert_ne!(base, diff_counter);
        assert_ne!(base, diff_key);
    }

    #[test]
    fn create_then_validate_broadcast_hello_roundtrips() {
        let group_key = [3u8; 16];
        let framer_group_key = group_key;
        let mut framer = OtpFramer::new([9u8; 16], Some(framer_group_key), 2, 1);
        let src = LinkAddr::from_slice(&[0xAB, 0xCD]).unwrap();
        let local = LinkAddr::from_slice(&[0x11, 0x22]).unwrap();
        let mut buf = [0u8; 16];
        let ctx = OtpContext::Normal {
            receiver: LinkAddr::broadcast(2),
            group_key: &group_key,
        };
        let len = framer.create_header(&mut buf, FrameType::Hello, &src, 1, &ctx).unwrap();

        let table = table();
        let validated = framer.validate(&buf[..len], &local, &table).unwrap();
        assert_eq!(validated.frame_type, FrameType::Hello);
        assert_eq!(validated.src_addr, src);
        assert_eq!(validated.counter, 1);
    }

    #[test]
    fn tampered_otp_is_rejected() {
        let group_key = [3u8; 16];
        let mut framer = OtpFramer::new([9u8; 16], Some(group_key), 2, 1);
        let src = LinkAddr::from_slice(&[0xAB, 0xCD]).unwrap();
        let local = LinkAddr::from_slice(&[0x11, 0x22]).unwrap();
        let mut buf = [0u8; 16];
        let ctx = OtpContext::Normal {
            receiver: LinkAddr::broadcast(2),
            group_key: &group_key,
        };
        let len = framer.create_header(&mut buf, FrameType::Hello, &src, 1, &ctx).unwrap();
        buf[len - 1] ^= 0xFF;

        let table = table();
        assert!(framer.validate(&buf[..len], &local, &table).is_none());
    }

    #[test]
    fn hello_ack_otp_cache_rejects_replay() {
        let mut framer = OtpFramer::new([9u8; 16], Some([3u8; 16]), 2, 1);
        let otp = [1u8, 2, 3];
        assert!(framer.check_and_record_hello_ack_otp(otp));
        assert!(!framer.check_and_record_hello_ack_otp(otp));
    }

    #[test]
    fn hello_ack_structural_validation_does_not_need_a_tentative_record() {
        // The receiving side of a HELLOACK never holds a tentative record
        // for the peer that sent it (the handshake's role asymmetry):
        // `validate` must not require one. The special-OTP match itself
        // happens in `AkesEngine::handle_hello_ack`, not here.
        let mut framer = OtpFramer::new([9u8; 16], Some([3u8; 16]), 2, 1);
        let peer = LinkAddr::from_slice(&[0x01, 0x02]).unwrap();
        let local = LinkAddr::from_slice(&[0x11, 0x22]).unwrap();
        let challenge = [5u8; 8];

        let table = table();
        let mut buf = [0u8; 16];
        let ctx = OtpContext::Special {
            peer_addr: local,
            challenge,
        };
        let len = framer.create_header(&mut buf, FrameType::HelloAck, &peer, 1, &ctx).unwrap();
        assert!(framer.validate(&buf[..len], &local, &table).is_some());
    }
}
