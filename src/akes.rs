// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handshake engine (C6): the HELLO → HELLOACK → ACK admission protocol.
//!
//! A bare broadcast HELLO carrying an 8-byte challenge is the only
//! message a node needs to have heard nothing from a peer before; the
//! closing ACK leaves both sides holding a permanent record (§4.2).
//!
//! Key agreement here is deliberately simple: both the challenge exchange
//! and the pairwise key are derived from values each side already has —
//! the two challenges and the pre-shared `potr_key` — rather than calling
//! out to a Diffie-Hellman-style exchange or an external CSPRNG for key
//! material (the secure random source is out of scope; see
//! [`crate::radio::EntropySource`]'s doc comment). See `DESIGN.md` for why
//! this reading was chosen over the alternatives the source left
//! ambiguous.

use crate::addr::LinkAddr;
use crate::config::Config;
use crate::crypto::{Aead, Key};
use crate::error::{Error, Result};
use crate::nbr::{NeighborTable, TentativeStatus, TentativeVariant, CHALLENGE_LEN};
use crate::otp::{OtpFramer, OTP_LEN};
use crate::radio::EntropySource;

/// This node's own outstanding HELLO, if any. A node only ever probes for
/// one new neighbor at a time; a second `begin_hello` simply replaces it.
struct PendingHello {
    challenge: [u8; CHALLENGE_LEN],
    expiration_time: u32,
}

/// Material the caller needs to assemble the wire bytes of a HELLOACK,
/// beyond the fixed OTP header (§4.1 `OtpContext::Special`).
pub struct HelloAckMaterial {
    /// The challenge carried by the original HELLO — the header's OTP
    /// context binds to this, not to `echo_challenge`.
    pub peer_challenge: [u8; CHALLENGE_LEN],
    /// This node's own fresh challenge, carried in the HELLOACK's payload
    /// (not its header) for the peer to echo back in the OTP of its ACK.
    pub echo_challenge: [u8; CHALLENGE_LEN],
}

/// Material the caller needs to assemble the wire bytes of an ACK.
pub struct AckMaterial {
    /// The challenge to bind the ACK's special OTP to (the HELLOACK
    /// sender's echo challenge).
    pub peer_challenge: [u8; CHALLENGE_LEN],
}

fn derive_pairwise_key(potr_key: &Key, challenge_a: &[u8; CHALLENGE_LEN], challenge_b: &[u8; CHALLENGE_LEN]) -> Key {
    let mut block = [0u8; 16];
    block[..CHALLENGE_LEN].copy_from_slice(challenge_a);
    block[CHALLENGE_LEN..].copy_from_slice(challenge_b);
    Aead::encrypt_block(potr_key, &block)
}

fn random_challenge<E: EntropySource>(entropy: &mut E) -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    for byte in &mut challenge {
        *byte = entropy.uniform(256) as u8;
    }
    challenge
}

/// One node's view of the handshake protocol. Stateless beyond tracking
/// its own in-flight HELLO; everything else lives in the neighbor table.
pub struct AkesEngine {
    local_addr: LinkAddr,
    pending_hello: Option<PendingHello>,
}

impl AkesEngine {
    #[must_use]
    pub fn new(local_addr: LinkAddr) -> Self {
        Self {
            local_addr,
            pending_hello: None,
        }
    }

    /// Begin a new handshake attempt: generate a fresh challenge and
    /// remember it until a matching HELLOACK arrives or `lifetime_secs`
    /// elapses. Returns the challenge for the caller to place in the
    /// outgoing HELLO's payload.
    pub fn begin_hello<E: EntropySource>(
        &mut self,
        entropy: &mut E,
        now_secs: u32,
        lifetime_secs: u32,
    ) -> [u8; CHALLENGE_LEN] {
        let challenge = random_challenge(entropy);
        self.pending_hello = Some(PendingHello {
            challenge,
            expiration_time: now_secs + lifetime_secs,
        });
        challenge
    }

    /// Handle a freshly OTP-validated HELLO from `sender_addr` carrying
    /// `challenge`.
    ///
    /// Admission (§4.2): accepted only if no tentative record already
    /// exists for the sender (a duplicate/retransmitted HELLO is silently
    /// a no-op, `Ok(None)`) and the table's tentative cap allows a new
    /// entry (propagated from [`NeighborTable::new_tentative`] as
    /// [`Error::TooManyTentatives`]).
    ///
    /// On success, returns the number of ticks to wait before sending the
    /// HELLOACK, drawn uniformly from `0..max_wait_ticks` (§4.2.1) to
    /// desynchronize replies from multiple nodes that heard the same
    /// broadcast HELLO.
    pub fn handle_hello<E: EntropySource>(
        &self,
        table: &mut NeighborTable,
        entropy: &mut E,
        sender_addr: LinkAddr,
        challenge: [u8; CHALLENGE_LEN],
        now_secs: u32,
        max_wait_ticks: u32,
    ) -> Result<Option<u32>> {
        if table.get_by_sender_addr(&sender_addr).is_some_and(|e| e.tentative.is_some()) {
            log::trace!("duplicate hello ignored, tentative record already exists");
            return Ok(None);
        }
        table.new_tentative(sender_addr, now_secs, challenge, [0; OTP_LEN])?;
        log::debug!("hello accepted, tentative record created");
        Ok(Some(entropy.uniform(max_wait_ticks.max(1))))
    }

    /// Build the material for a HELLOACK replying to `peer_addr`'s HELLO,
    /// transitioning that neighbor's tentative record to
    /// `TENTATIVE_AWAITING_ACK` (§4.2) and, when pairwise keys are
    /// enabled, deriving and caching the pairwise key right away so the
    /// closing ACK only needs to confirm it, not negotiate it further.
    pub fn build_hello_ack<E: EntropySource>(
        &self,
        table: &mut NeighborTable,
        framer: &OtpFramer,
        config: &Config,
        entropy: &mut E,
        peer_addr: LinkAddr,
    ) -> Result<HelloAckMaterial> {
        let peer_challenge = {
            let entry = table
                .get_by_sender_addr(&peer_addr)
                .ok_or(Error::InvalidConfig("build_hello_ack: no tentative record"))?;
            let tentative = entry
                .tentative
                .as_ref()
                .ok_or(Error::InvalidConfig("build_hello_ack: no tentative record"))?;
            match &tentative.variant {
                TentativeVariant::Challenge { challenge } => *challenge,
                TentativeVariant::PendingKey { .. } => {
                    return Err(Error::InvalidConfig("build_hello_ack: already past challenge stage"))
                }
            }
        };

        let echo_challenge = random_challenge(entropy);
        let pairwise_key = config
            .with_pairwise_keys
            .then(|| derive_pairwise_key(framer.potr_key(), &peer_challenge, &echo_challenge));
        let cached_otp = framer.special_otp_self(self.local_addr.as_slice(), &echo_challenge);
        let variant = match pairwise_key {
            Some(key) => TentativeVariant::PendingKey { key },
            None => TentativeVariant::Challenge { challenge: peer_challenge },
        };
        table.mark_awaiting_ack(&peer_addr, variant, cached_otp)?;
        log::debug!("hello-ack sent, tentative record now awaiting ack");

        Ok(HelloAckMaterial {
            peer_challenge,
            echo_challenge,
        })
    }

    /// Handle a HELLOACK from `sender_addr` carrying `frame_otp` (the
    /// header's raw OTP field, structurally validated only — see
    /// [`crate::otp::OtpFramer::validate`]'s notes on the handshake's role
    /// asymmetry) and the sender's `echo_challenge` payload.
    ///
    /// This is where the special-OTP match against this node's own
    /// pending challenge actually happens, along with the HELLOACK
    /// replay-cache check: the node on this side of the handshake holds no
    /// tentative record for `sender_addr` to derive the expected OTP from,
    /// only its own `pending_hello`. Returns the material for this node's
    /// closing ACK and, as a side effect, creates a permanent record for
    /// `sender_addr` directly — this side of the handshake has both
    /// challenges and the pre-shared secret in hand already, so there is
    /// nothing left to wait for.
    pub fn handle_hello_ack(
        &mut self,
        table: &mut NeighborTable,
        config: &Config,
        framer: &mut OtpFramer,
        sender_addr: LinkAddr,
        frame_otp: [u8; OTP_LEN],
        echo_challenge: [u8; CHALLENGE_LEN],
        peer_foreign_index: u8,
        now_secs: u32,
    ) -> Result<AckMaterial> {
        let pending = self
            .pending_hello
            .as_ref()
            .ok_or(Error::InvalidConfig("handle_hello_ack: no pending hello"))?;
        if now_secs >= pending.expiration_time {
            self.pending_hello = None;
            log::debug!("hello-ack rejected: pending hello already expired");
            return Err(Error::InvalidConfig("handle_hello_ack: pending hello expired"));
        }
        let challenge_a = pending.challenge;
        let expected_otp = framer.special_otp_self(self.local_addr.as_slice(), &challenge_a);
        if expected_otp != frame_otp {
            log::warn!("hello-ack rejected: special otp mismatch");
            return Err(Error::InvalidConfig("handle_hello_ack: otp mismatch"));
        }
        if !framer.check_and_record_hello_ack_otp(frame_otp) {
            log::warn!("hello-ack rejected: replayed otp");
            return Err(Error::InvalidConfig("handle_hello_ack: replayed otp"));
        }

        let pairwise_key = config
            .with_pairwise_keys
            .then(|| derive_pairwise_key(framer.potr_key(), &challenge_a, &echo_challenge));
        let group_key = config.with_group_keys.then(|| framer.group_key().copied()).flatten();

        table.new_permanent(sender_addr, peer_foreign_index, pairwise_key, group_key, now_secs)?;
        self.pending_hello = None;
        log::debug!("hello-ack accepted, permanent record created without a tentative stage");

        Ok(AckMaterial {
            peer_challenge: echo_challenge,
        })
    }

    /// Handle a freshly OTP-validated ACK from `peer_addr` (the cached-OTP
    /// match of §4.1 step 6 has already happened in
    /// [`crate::otp::OtpFramer::validate`]); promotes the tentative record
    /// to permanent (§4.2, P5), consuming whatever key
    /// [`Self::build_hello_ack`] cached.
    pub fn handle_ack(
        &self,
        table: &mut NeighborTable,
        config: &Config,
        framer: &OtpFramer,
        peer_addr: LinkAddr,
        peer_foreign_index: u8,
        now_secs: u32,
    ) -> Result<()> {
        let entry = table
            .get_by_sender_addr(&peer_addr)
            .ok_or(Error::InvalidConfig("handle_ack: no tentative record"))?;
        let tentative = entry
            .tentative
            .as_ref()
            .ok_or(Error::InvalidConfig("handle_ack: no tentative record"))?;
        if tentative.status != TentativeStatus::TentativeAwaitingAck {
            return Err(Error::InvalidConfig("handle_ack: tentative record not awaiting ack"));
        }
        let pairwise_key = match &tentative.variant {
            TentativeVariant::PendingKey { key } => Some(*key),
            TentativeVariant::Challenge { .. } => None,
        };
        let group_key = config.with_group_keys.then(|| framer.group_key().copied()).flatten();
        table.promote(&peer_addr, peer_foreign_index, pairwise_key, group_key, now_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::otp::OtpFramer;

    struct StepEntropy(u32);
    impl EntropySource for StepEntropy {
        fn uniform(&mut self, bound: u32) -> u32 {
            self.0 = self.0.wrapping_add(1);
            self.0 % bound.max(1)
        }
    }

    fn addr(bytes: [u8; 2]) -> LinkAddr {
        LinkAddr::from_slice(&bytes).unwrap()
    }

    fn config() -> Config {
        Config::builder().wake_interval_ticks(512).max_neighbors(8).build().unwrap()
    }

    /// Scenario 1 (§8): full HELLO/HELLOACK/ACK exchange leaves both sides
    /// with a permanent record and no lingering tentative state.
    #[test]
    fn full_handshake_reaches_permanent_on_both_sides() {
        let config = config();
        let a_addr = addr([0x84, 0x6C]);
        let b_addr = addr([0x85, 0xDC]);
        let potr_key = [0x42u8; 16];
        let group_key = [0x24u8; 16];

        let mut a_engine = AkesEngine::new(a_addr);
        let b_engine = AkesEngine::new(b_addr);
        let mut a_table = NeighborTable::new(&config).unwrap();
        let mut b_table = NeighborTable::new(&config).unwrap();
        let mut a_framer = OtpFramer::new(potr_key, Some(group_key), 2, 1);
        let b_framer = OtpFramer::new(potr_key, Some(group_key), 2, 1);
        let mut entropy = StepEntropy(7);

        let challenge_a = a_engine.begin_hello(&mut entropy, 0, 3600);

        let wait = b_engine
            .handle_hello(&mut b_table, &mut entropy, a_addr, challenge_a, 0, 16)
            .unwrap();
        assert!(wait.is_some());

        let hello_ack = b_engine
            .build_hello_ack(&mut b_table, &b_framer, &config, &mut entropy, a_addr)
            .unwrap();
        assert_eq!(hello_ack.peer_challenge, challenge_a);

        let hello_ack_otp = b_framer.special_otp_self(a_addr.as_slice(), &hello_ack.peer_challenge);
        let ack_material = a_engine
            .handle_hello_ack(
                &mut a_table,
                &config,
                &mut a_framer,
                b_addr,
                hello_ack_otp,
                hello_ack.echo_challenge,
                3,
                1,
            )
            .unwrap();
        assert_eq!(ack_material.peer_challenge, hello_ack.echo_challenge);

        b_engine
            .handle_ack(&mut b_table, &config, &b_framer, a_addr, 9, 2)
            .unwrap();

        let a_view_of_b = a_table.get_by_sender_addr(&b_addr).unwrap();
        assert!(a_view_of_b.permanent.is_some());
        assert!(a_view_of_b.tentative.is_none());

        let b_view_of_a = b_table.get_by_sender_addr(&a_addr).unwrap();
        assert!(b_view_of_a.permanent.is_some());
        assert!(b_view_of_a.tentative.is_none());

        assert_eq!(
            a_view_of_b.permanent.as_ref().unwrap().pairwise_key,
            b_view_of_a.permanent.as_ref().unwrap().pairwise_key,
            "both sides must derive the same pairwise key"
        );
    }

    /// Scenario 5 (§8): the sixth concurrent HELLO is refused once
    /// `max_tentatives` is reached.
    #[test]
    fn sixth_concurrent_hello_is_refused() {
        let config = Config::builder()
            .wake_interval_ticks(512)
            .max_tentatives(2)
            .max_neighbors(8)
            .build()
            .unwrap();
        let engine = AkesEngine::new(addr([0, 1]));
        let mut table = NeighborTable::new(&config).unwrap();
        let mut entropy = StepEntropy(1);

        engine
            .handle_hello(&mut table, &mut entropy, addr([1, 0]), [1; CHALLENGE_LEN], 0, 4)
            .unwrap();
        engine
            .handle_hello(&mut table, &mut entropy, addr([2, 0]), [2; CHALLENGE_LEN], 0, 4)
            .unwrap();
        let result = engine.handle_hello(&mut table, &mut entropy, addr([3, 0]), [3; CHALLENGE_LEN], 0, 4);
        assert!(matches!(result, Err(Error::TooManyTentatives)));
    }

    #[test]
    fn duplicate_hello_from_same_sender_is_a_no_op() {
        let config = config();
        let engine = AkesEngine::new(addr([0, 1]));
        let mut table = NeighborTable::new(&config).unwrap();
        let mut entropy = StepEntropy(1);
        let sender = addr([9, 9]);

        let first = engine
            .handle_hello(&mut table, &mut entropy, sender, [1; CHALLENGE_LEN], 0, 4)
            .unwrap();
        assert!(first.is_some());
        let second = engine
            .handle_hello(&mut table, &mut entropy, sender, [1; CHALLENGE_LEN], 0, 4)
            .unwrap();
        assert!(second.is_none(), "duplicate HELLO must not disturb the existing tentative record");
    }

    #[test]
    fn expired_pending_hello_rejects_late_hello_ack() {
        let config = config();
        let mut engine = AkesEngine::new(addr([0, 1]));
        let mut table = NeighborTable::new(&config).unwrap();
        let mut framer = OtpFramer::new([1u8; 16], Some([2u8; 16]), 2, 1);
        let mut entropy = StepEntropy(3);

        let _challenge = engine.begin_hello(&mut entropy, 0, 10);
        let result = engine.handle_hello_ack(
            &mut table,
            &config,
            &mut framer,
            addr([5, 5]),
            [0; OTP_LEN],
            [0; CHALLENGE_LEN],
            0,
            20,
        );
        assert!(result.is_err());
    }
}
