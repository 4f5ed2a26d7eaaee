// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link-layer engine (integration).
//!
//! Owns one of each component — the duty-cycle state machine (C7), the
//! framer chain (C8), the handshake engine (C6), and the neighbor table
//! (C4) — and is the piece of this crate that actually drives a frame
//! from a radio event through OTP admission to the handshake or upper
//! layer, and drives an outgoing HELLO/HELLOACK/ACK back out the other
//! way. Everything below this module is unit-correct on its own; this is
//! what wires those units into the bottom-up/top-down data flow the
//! crate-root doc describes.

use heapless::Vec as HVec;

use crate::addr::LinkAddr;
use crate::akes::{AckMaterial, AkesEngine, HelloAckMaterial};
use crate::config::Config;
use crate::error::Result;
use crate::framer::{FramerChain, OutboundFrame, PhyFramer};
use crate::nbr::{NeighborTable, CHALLENGE_LEN};
use crate::otp::{FrameType, OtpContext, OtpFramer};
use crate::radio::{CcaResult, EntropySource, Radio, MAX_FRAME_LEN};
use crate::sde::{DutyCycleAction, DutyCycleInput, DutyCycleMachine, TimingConfig};

const HELLO_ACK_PAYLOAD_LEN: usize = CHALLENGE_LEN + 1;

fn read_challenge(payload: &[u8]) -> Option<[u8; CHALLENGE_LEN]> {
    if payload.len() < CHALLENGE_LEN {
        return None;
    }
    let mut challenge = [0u8; CHALLENGE_LEN];
    challenge.copy_from_slice(&payload[..CHALLENGE_LEN]);
    Some(challenge)
}

fn read_hello_ack_payload(payload: &[u8]) -> Option<([u8; CHALLENGE_LEN], u8)> {
    if payload.len() < HELLO_ACK_PAYLOAD_LEN {
        return None;
    }
    let mut echo = [0u8; CHALLENGE_LEN];
    echo.copy_from_slice(&payload[..CHALLENGE_LEN]);
    Some((echo, payload[CHALLENGE_LEN]))
}

/// An inbound unicast/broadcast data or command frame that has cleared
/// OTP admission. Holds its own storage since the radio's receive buffer
/// is about to be reused for the next frame.
pub struct DataFrame {
    /// The frame's source address.
    pub src_addr: LinkAddr,
    /// The frame's header counter.
    pub counter: u32,
    /// The payload bytes following the header, exactly as received —
    /// further authenticated decryption is the caller's job (§1).
    pub payload: HVec<u8, MAX_FRAME_LEN>,
}

/// What came of feeding one buffered frame through
/// [`LinkLayerEngine::poll_inbound`].
pub enum InboundOutcome {
    /// A HELLO was admitted. The caller should wait `wait_ticks` before
    /// calling [`LinkLayerEngine::begin_hello_ack`] (§4.2.1).
    HelloAdmitted {
        /// The new neighbor's address.
        peer: LinkAddr,
        /// Ticks to wait before replying, drawn from `0..max_wait_ticks`.
        wait_ticks: u32,
    },
    /// A HELLOACK was accepted and this side now holds a permanent record
    /// for the peer. The caller should send the closing ACK next.
    HandshakeCompleted {
        /// The newly admitted neighbor's address.
        peer: LinkAddr,
        /// Material for the closing ACK's header.
        ack: AckMaterial,
    },
    /// A closing ACK was accepted; the peer's record is now permanent on
    /// both sides of the handshake.
    HandshakeConfirmed {
        /// The confirmed neighbor's address.
        peer: LinkAddr,
    },
    /// An ordinary data or command frame cleared OTP admission.
    Data(DataFrame),
    /// A duty-cycle action this engine does not resolve itself (arm a
    /// timer, perform a CCA, flush and go back to sleep, ...): the caller
    /// drives the radio/timer hardware and feeds the result back in.
    Pending(DutyCycleAction),
    /// The frame was dropped: failed OTP validation, a malformed
    /// handshake payload, or a rejected handshake transition. Already
    /// logged by whichever layer rejected it.
    Dropped,
}

/// Wires C1 (radio) events into C8 (framer chain) into C6 (handshake) and
/// C4 (neighbor table), and back out again for outbound handshake frames.
///
/// Generic over the platform [`Radio`], [`EntropySource`], and
/// [`PhyFramer`] seams — everything else is owned directly.
pub struct LinkLayerEngine<R: Radio, Ent: EntropySource, P: PhyFramer> {
    local_addr: LinkAddr,
    config: Config,
    timing: TimingConfig,
    hello_reply_window_ticks: u32,
    table: NeighborTable,
    handshake: AkesEngine,
    chain: FramerChain<P>,
    duty_cycle: DutyCycleMachine,
    radio: R,
    entropy: Ent,
    counter: u32,
    rx_buf: [u8; MAX_FRAME_LEN],
}

impl<R: Radio, Ent: EntropySource, P: PhyFramer> LinkLayerEngine<R, Ent, P> {
    /// # Errors
    ///
    /// Propagates [`crate::error::Error::InvalidConfig`] from
    /// [`NeighborTable::new`] if `config.max_neighbors` exceeds the
    /// compiled-in pool capacity.
    pub fn new(
        local_addr: LinkAddr,
        config: Config,
        timing: TimingConfig,
        hello_reply_window_ticks: u32,
        otp: OtpFramer,
        phy: P,
        radio: R,
        entropy: Ent,
    ) -> Result<Self> {
        let table = NeighborTable::new(&config)?;
        Ok(Self {
            local_addr,
            config,
            timing,
            hello_reply_window_ticks,
            table,
            handshake: AkesEngine::new(local_addr),
            chain: FramerChain::new(otp, phy),
            duty_cycle: DutyCycleMachine::new(),
            radio,
            entropy,
            counter: 0,
            rx_buf: [0u8; MAX_FRAME_LEN],
        })
    }

    fn next_counter(&mut self) -> u32 {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        counter
    }

    /// Reset the receive-side duty-cycle machine for a fresh wake-up.
    pub fn begin_wake(&mut self) {
        self.duty_cycle = DutyCycleMachine::new();
    }

    /// Feed a radio or timer event into the duty-cycle machine, resolving
    /// [`DutyCycleAction::RunOtpFramer`] into an actual [`Self::poll_inbound`]
    /// call. Returns `None` if the event was not meaningful in the
    /// machine's current state.
    pub fn on_radio_event(&mut self, input: DutyCycleInput, now_secs: u32) -> Option<InboundOutcome> {
        let action = self.duty_cycle.step(input, &self.timing)?;
        Some(self.resolve_action(action, now_secs))
    }

    /// Feed a CCA result into the duty-cycle machine. See
    /// [`Self::on_radio_event`].
    pub fn on_cca_result(&mut self, result: CcaResult, now_secs: u32) -> InboundOutcome {
        let action = self.duty_cycle.observe_cca(result, &self.timing);
        self.resolve_action(action, now_secs)
    }

    fn resolve_action(&mut self, action: DutyCycleAction, now_secs: u32) -> InboundOutcome {
        match action {
            DutyCycleAction::RunOtpFramer => self.poll_inbound(now_secs),
            other => InboundOutcome::Pending(other),
        }
    }

    /// Read whatever the radio has buffered, run it through the framer
    /// chain, and dispatch an admitted header to the handshake engine or
    /// hand a data frame up. Drops silently (returning
    /// [`InboundOutcome::Dropped`]) on any validation failure, per the
    /// crate's error taxonomy.
    pub fn poll_inbound(&mut self, now_secs: u32) -> InboundOutcome {
        let read = self.radio.read_buffered(&mut self.rx_buf);
        let local_addr = self.local_addr;
        let Some((inbound, stripped)) = self.chain.parse_inbound(&self.rx_buf[..read], &local_addr, &self.table)
        else {
            return InboundOutcome::Dropped;
        };
        let header = inbound.header;
        let payload = &stripped[inbound.payload_offset..];

        match header.frame_type {
            FrameType::Hello => {
                let Some(challenge) = read_challenge(payload) else {
                    log::debug!("hello dropped: payload too short for a challenge");
                    return InboundOutcome::Dropped;
                };
                match self.handshake.handle_hello(
                    &mut self.table,
                    &mut self.entropy,
                    header.src_addr,
                    challenge,
                    now_secs,
                    self.hello_reply_window_ticks,
                ) {
                    Ok(Some(wait_ticks)) => InboundOutcome::HelloAdmitted {
                        peer: header.src_addr,
                        wait_ticks,
                    },
                    Ok(None) => InboundOutcome::Dropped,
                    Err(err) => {
                        log::debug!("hello rejected: {err}");
                        InboundOutcome::Dropped
                    }
                }
            }
            FrameType::HelloAck | FrameType::HelloAckPairwise => {
                let Some((echo_challenge, foreign_index)) = read_hello_ack_payload(payload) else {
                    log::debug!("hello-ack dropped: malformed payload");
                    return InboundOutcome::Dropped;
                };
                match self.handshake.handle_hello_ack(
                    &mut self.table,
                    &self.config,
                    self.chain.otp_mut(),
                    header.src_addr,
                    header.frame_otp,
                    echo_challenge,
                    foreign_index,
                    now_secs,
                ) {
                    Ok(ack) => InboundOutcome::HandshakeCompleted {
                        peer: header.src_addr,
                        ack,
                    },
                    Err(err) => {
                        log::debug!("hello-ack rejected: {err}");
                        InboundOutcome::Dropped
                    }
                }
            }
            FrameType::Ack => {
                let Some(&foreign_index) = payload.first() else {
                    log::debug!("ack dropped: empty payload");
                    return InboundOutcome::Dropped;
                };
                match self.handshake.handle_ack(
                    &mut self.table,
                    &self.config,
                    self.chain.otp(),
                    header.src_addr,
                    foreign_index,
                    now_secs,
                ) {
                    Ok(()) => InboundOutcome::HandshakeConfirmed { peer: header.src_addr },
                    Err(err) => {
                        log::debug!("ack rejected: {err}");
                        InboundOutcome::Dropped
                    }
                }
            }
            FrameType::UnicastData | FrameType::UnicastCommand | FrameType::BroadcastData | FrameType::BroadcastCommand => {
                let Ok(owned) = HVec::from_slice(payload) else {
                    log::debug!("data frame dropped: payload exceeds scratch buffer");
                    return InboundOutcome::Dropped;
                };
                InboundOutcome::Data(DataFrame {
                    src_addr: header.src_addr,
                    counter: header.counter,
                    payload: owned,
                })
            }
            FrameType::Acknowledgement => InboundOutcome::Dropped,
        }
    }

    /// Begin a new handshake attempt, broadcasting a HELLO carrying a
    /// fresh challenge under the normal-OTP key (§4.2, `OtpContext::Normal`).
    pub fn send_hello(&mut self, lifetime_secs: u32, now_secs: u32) -> Option<OutboundFrame> {
        let challenge = self.handshake.begin_hello(&mut self.entropy, now_secs, lifetime_secs);
        let group_key = *self.chain.otp().group_key()?;
        let counter = self.next_counter();
        let ctx = OtpContext::Normal {
            receiver: LinkAddr::broadcast(self.local_addr.len()),
            group_key: &group_key,
        };
        self.chain.build_outbound(FrameType::Hello, &self.local_addr, counter, &ctx, &challenge)
    }

    /// Build the material for a HELLOACK replying to `peer_addr`'s HELLO.
    /// See [`crate::akes::AkesEngine::build_hello_ack`].
    ///
    /// # Errors
    ///
    /// Propagates `build_hello_ack`'s errors (no tentative record, or the
    /// record already past the challenge stage).
    pub fn begin_hello_ack(&mut self, peer_addr: LinkAddr) -> Result<HelloAckMaterial> {
        self.handshake
            .build_hello_ack(&mut self.table, self.chain.otp(), &self.config, &mut self.entropy, peer_addr)
    }

    /// Assemble the wire bytes of a HELLOACK to `peer_addr`, carrying
    /// `material`'s echo challenge and this node's local index for the
    /// peer (so the peer can address this node compactly once permanent).
    pub fn send_hello_ack(
        &mut self,
        peer_addr: LinkAddr,
        material: &HelloAckMaterial,
        local_index: u8,
    ) -> Option<OutboundFrame> {
        let mut payload: HVec<u8, HELLO_ACK_PAYLOAD_LEN> = HVec::new();
        payload.extend_from_slice(&material.echo_challenge).ok()?;
        payload.push(local_index).ok()?;
        let counter = self.next_counter();
        let ctx = OtpContext::Special {
            peer_addr,
            challenge: material.peer_challenge,
        };
        self.chain.build_outbound(FrameType::HelloAck, &self.local_addr, counter, &ctx, &payload)
    }

    /// Assemble the wire bytes of the closing ACK to `peer_addr`, carrying
    /// this node's local index for the peer.
    pub fn send_ack(&mut self, peer_addr: LinkAddr, material: &AckMaterial, local_index: u8) -> Option<OutboundFrame> {
        let payload = [local_index];
        let counter = self.next_counter();
        let ctx = OtpContext::Special {
            peer_addr,
            challenge: material.peer_challenge,
        };
        self.chain.build_outbound(FrameType::Ack, &self.local_addr, counter, &ctx, &payload)
    }

    /// The underlying radio driver, for a caller that needs to act on a
    /// [`DutyCycleAction`] returned via [`InboundOutcome::Pending`].
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Read-only access to the neighbor table, e.g. to look up a peer's
    /// local index after a handshake transition.
    #[must_use]
    pub fn table(&self) -> &NeighborTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::NoOpPhy;
    use crate::radio::RadioEvent;

    struct FakeRadio {
        inbox: HVec<u8, MAX_FRAME_LEN>,
    }

    impl FakeRadio {
        fn new() -> Self {
            Self { inbox: HVec::new() }
        }

        fn deliver(&mut self, frame: &[u8]) {
            self.inbox.clear();
            let _ = self.inbox.extend_from_slice(frame);
        }
    }

    impl Radio for FakeRadio {
        fn on(&mut self) {}
        fn off(&mut self) {}
        fn cca(&mut self) -> CcaResult {
            CcaResult::Clear
        }
        fn prepare(&mut self, _frame: &[u8]) {}
        fn transmit(&mut self) {}
        fn read_buffered(&mut self, buf: &mut [u8]) -> usize {
            let len = self.inbox.len();
            buf[..len].copy_from_slice(&self.inbox);
            self.inbox.clear();
            len
        }
        fn flush_rx(&mut self) {
            self.inbox.clear();
        }
        fn set_fifop_threshold(&mut self, _bytes: usize) {}
        fn last_sfd(&self) -> Option<crate::radio::Ticks> {
            None
        }
    }

    struct StepEntropy(u32);
    impl EntropySource for StepEntropy {
        fn uniform(&mut self, bound: u32) -> u32 {
            self.0 = self.0.wrapping_add(1);
            self.0 % bound.max(1)
        }
    }

    fn engine(
        local_addr: LinkAddr,
        potr_key: crate::crypto::Key,
        group_key: crate::crypto::Key,
    ) -> LinkLayerEngine<FakeRadio, StepEntropy, NoOpPhy> {
        let config = Config::builder().wake_interval_ticks(512).max_neighbors(8).build().unwrap();
        let timing = TimingConfig::approx(512);
        let otp = OtpFramer::new(potr_key, Some(group_key), 2, 1);
        LinkLayerEngine::new(local_addr, config, timing, 16, otp, NoOpPhy, FakeRadio::new(), StepEntropy(3)).unwrap()
    }

    /// Drives two wired engines through a full HELLO → HELLOACK → ACK
    /// exchange entirely through [`LinkLayerEngine::poll_inbound`], proving
    /// the documented bottom-up inbound path actually reaches the
    /// handshake engine end to end (rather than only in tests that call
    /// `AkesEngine` methods directly).
    #[test]
    fn full_handshake_runs_through_the_wired_engine() {
        let potr_key = [0x11u8; 16];
        let group_key = [0x22u8; 16];
        let a_addr = LinkAddr::from_slice(&[0x84, 0x6C]).unwrap();
        let b_addr = LinkAddr::from_slice(&[0x85, 0xDC]).unwrap();

        let mut a = engine(a_addr, potr_key, group_key);
        let mut b = engine(b_addr, potr_key, group_key);

        let hello = a.send_hello(3600, 0).unwrap();
        b.radio_mut().deliver(hello.as_slice());
        let outcome = b.poll_inbound(0);
        let wait_ticks = match outcome {
            InboundOutcome::HelloAdmitted { peer, wait_ticks } => {
                assert_eq!(peer, a_addr);
                wait_ticks
            }
            _ => panic!("expected HelloAdmitted"),
        };
        let _ = wait_ticks;

        let hello_ack_material = b.begin_hello_ack(a_addr).unwrap();
        let b_local_index_for_a = b.table().get_by_sender_addr(&a_addr).unwrap().local_index;
        let hello_ack = b
            .send_hello_ack(a_addr, &hello_ack_material, b_local_index_for_a)
            .unwrap();

        a.radio_mut().deliver(hello_ack.as_slice());
        let outcome = a.poll_inbound(1);
        let ack_material = match outcome {
            InboundOutcome::HandshakeCompleted { peer, ack } => {
                assert_eq!(peer, b_addr);
                ack
            }
            _ => panic!("expected HandshakeCompleted"),
        };

        let a_local_index_for_b = a.table().get_by_sender_addr(&b_addr).unwrap().local_index;
        assert!(a.table().get_by_sender_addr(&b_addr).unwrap().permanent.is_some());

        let ack = a.send_ack(b_addr, &ack_material, a_local_index_for_b).unwrap();
        b.radio_mut().deliver(ack.as_slice());
        let outcome = b.poll_inbound(2);
        match outcome {
            InboundOutcome::HandshakeConfirmed { peer } => assert_eq!(peer, a_addr),
            _ => panic!("expected HandshakeConfirmed"),
        }

        let a_view_of_b = a.table().get_by_sender_addr(&b_addr).unwrap();
        let b_view_of_a = b.table().get_by_sender_addr(&a_addr).unwrap();
        assert!(b_view_of_a.permanent.is_some());
        assert!(b_view_of_a.tentative.is_none());
        assert_eq!(
            a_view_of_b.permanent.as_ref().unwrap().pairwise_key,
            b_view_of_a.permanent.as_ref().unwrap().pairwise_key,
            "both sides must derive the same pairwise key"
        );
    }

    /// `RunOtpFramer`, the action the duty-cycle review flagged as having
    /// no consumer, actually drives `poll_inbound` when routed through
    /// `on_radio_event`.
    #[test]
    fn run_otp_framer_action_is_resolved_into_poll_inbound() {
        let potr_key = [0x33u8; 16];
        let group_key = [0x44u8; 16];
        let a_addr = LinkAddr::from_slice(&[1, 1]).unwrap();
        let b_addr = LinkAddr::from_slice(&[2, 2]).unwrap();
        let mut a = engine(a_addr, potr_key, group_key);
        let mut b = engine(b_addr, potr_key, group_key);

        let hello = a.send_hello(3600, 0).unwrap();
        b.radio_mut().deliver(hello.as_slice());

        // Drive the duty-cycle machine through preamble detection to
        // WaitingFifop, the same path exercised by `sde`'s own
        // `duty_cycle_preamble_reaches_fifop_wait` test.
        b.begin_wake();
        b.on_cca_result(CcaResult::Busy, 0);
        b.on_radio_event(DutyCycleInput::TimerFired, 0);
        b.on_cca_result(CcaResult::Clear, 0);
        b.on_radio_event(DutyCycleInput::Radio(RadioEvent::Sfd { at: 10 }), 0);
        let outcome = b.on_radio_event(DutyCycleInput::Radio(RadioEvent::Fifop), 0);
        match outcome {
            Some(InboundOutcome::HelloAdmitted { peer, .. }) => assert_eq!(peer, a_addr),
            _ => panic!("expected HelloAdmitted via RunOtpFramer"),
        }
    }
}
