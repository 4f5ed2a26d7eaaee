// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Secure duty-cycle engine (C7).
//!
//! The receive and strobe state machines are expressed as enums plus a
//! `step` function re-entered by radio events and timer firings, per the
//! "coroutine control flow" design note: only one of the two is ever
//! active, so in a single-threaded embedded target they could share one
//! statically allocated union; here they are two ordinary enums instead,
//! since nothing stops a Rust caller from holding both (just never
//! stepping both in the same tick).
//!
//! Timing constants (§4.5.4) depend on the platform timer's tick
//! frequency and on calibration values (`T_rxcal`, `T_txcal`) this crate
//! has no way to know, since the radio driver that would measure them is
//! out of scope (§1). Rather than bake in a frequency assumption,
//! [`TimingConfig`] turns them into runtime fields a platform integration
//! supplies, the same way [`crate::config::Config`] turns other
//! externally-fixed knobs into constructor arguments.

use crate::crypto::{Aead, Key};
use crate::config::SecLevel;
use crate::error::{Result, TxOutcome};
use crate::nbr::PhaseLock;
use crate::radio::{CcaResult, RadioEvent, Ticks};

/// Runtime timing parameters for one engine instance (§4.5.4).
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    /// `T_w`: the duty-cycle wake period.
    pub wake_interval: Ticks,
    /// `T_i`: the nominal frame-repetition interval within a strobe.
    pub strobe_interval: Ticks,
    /// `T_c`: the spacing between the duty cycle's two CCAs.
    pub inter_cca_period: Ticks,
    /// Duration of one CCA.
    pub cca_duration: Ticks,
    /// Time budget to detect an SHR once silence is observed.
    pub shr_duration: Ticks,
    /// How long the radio dozes between fast-sleep silence rechecks.
    pub dozing_duration: Ticks,
    /// Upper bound on total time spent in the fast-sleep loop.
    pub max_noise_window: Ticks,
    /// Period between fast-sleep silence rechecks.
    pub silence_check_period: Ticks,
    /// `T_amin`: earliest tick (relative to TXDONE) an ack may arrive.
    pub ack_window_min: Ticks,
    /// `T_amax`: latest tick (relative to TXDONE) an ack may arrive.
    pub ack_window_max: Ticks,
    /// Minimum lead time any timer must be armed ahead of its deadline
    /// (`RTIMER_GUARD_TIME` + 1, §4.5.4).
    pub guard_time: Ticks,
    /// Fixed safety margin subtracted from a phase estimate before
    /// deferring a strobe's first transmission.
    pub phase_lock_guard_time: Ticks,
    /// Growth rate of phase-estimate uncertainty, ticks per second of
    /// age (`PHASE_LOCK_FREQ_TOLERANCE`).
    pub phase_lock_freq_tolerance: Ticks,
}

impl TimingConfig {
    /// Reasonable defaults at the approximate values named in §4.5.4,
    /// assuming a tick is one microsecond. `T_rxcal`/`T_txcal` are
    /// unknown at this layer and taken as zero; a platform integration
    /// should override `inter_cca_period`/`dozing_duration` with its own
    /// measured calibration.
    #[must_use]
    pub fn approx(wake_interval: Ticks) -> Self {
        let strobe_interval = 1068;
        let cca_duration = 128;
        Self {
            wake_interval,
            strobe_interval,
            inter_cca_period: strobe_interval,
            cca_duration,
            shr_duration: 160,
            dozing_duration: strobe_interval - cca_duration,
            max_noise_window: strobe_interval * 4,
            silence_check_period: 250,
            ack_window_min: 50,
            ack_window_max: 250,
            guard_time: 2,
            phase_lock_guard_time: 20,
            phase_lock_freq_tolerance: 1,
        }
    }
}

// ---------------------------------------------------------------------
// Authenticated acknowledgement (§4.5.3)
// ---------------------------------------------------------------------

/// Frame type byte for an acknowledgement frame (§6); distinct from
/// [`crate::otp::FrameType`]'s header chain, this is the whole wire
/// format of an ack frame.
pub const ACK_FRAME_TYPE: u8 = 8;

fn sec_level_byte(level: SecLevel) -> u8 {
    let code = match level {
        SecLevel::Mic32 | SecLevel::EncMic32 => 1u8,
        SecLevel::Mic64 | SecLevel::EncMic64 => 2,
        SecLevel::Mic128 | SecLevel::EncMic128 => 3,
    };
    if level.encrypts() {
        code | 0x04
    } else {
        code
    }
}

fn ack_nonce(receiver_addr: &[u8], counter: u32, sec_level: SecLevel) -> crate::crypto::Nonce {
    let mut nonce = [0u8; crate::crypto::NONCE_LEN];
    nonce[..receiver_addr.len()].copy_from_slice(receiver_addr);
    nonce[8..12].copy_from_slice(&counter.to_be_bytes());
    nonce[12] = sec_level_byte(sec_level);
    nonce
}

/// Build the wire bytes of an acknowledgement: `type(1) || delta(1) ||
/// mic(M)` (§4.5.3, §6). `first_header_byte` is the strobe index the
/// sender wrote into its current retransmission, part of the MIC's
/// additional data so a replayed ack from an earlier strobe count fails.
pub fn build_ack(
    key: &Key,
    first_header_byte: u8,
    delta: u8,
    receiver_addr: &[u8],
    counter: u32,
    sec_level: SecLevel,
) -> Result<heapless::Vec<u8, 18>> {
    let nonce = ack_nonce(receiver_addr, counter, sec_level);
    let aad = [first_header_byte, delta];
    let mut empty: [u8; 0] = [];
    let tag = Aead::encrypt_detached(key, &nonce, &aad, &mut empty, sec_level.mic_len())?;

    let mut out: heapless::Vec<u8, 18> = heapless::Vec::new();
    let _ = out.push(ACK_FRAME_TYPE);
    let _ = out.push(delta);
    let _ = out.extend_from_slice(&tag);
    Ok(out)
}

/// Validate an inbound acknowledgement frame against the expected
/// counter, sender identity, and strobe index. Returns the carried
/// `delta` on success.
#[must_use]
pub fn validate_ack(
    key: &Key,
    buf: &[u8],
    first_header_byte: u8,
    receiver_addr: &[u8],
    counter: u32,
    sec_level: SecLevel,
) -> Option<u8> {
    let mic_len = sec_level.mic_len();
    if buf.len() < 2 + mic_len || buf[0] != ACK_FRAME_TYPE {
        return None;
    }
    let delta = buf[1];
    let tag = &buf[2..2 + mic_len];
    let nonce = ack_nonce(receiver_addr, counter, sec_level);
    let aad = [first_header_byte, delta];
    let mut empty: [u8; 0] = [];
    Aead::decrypt_detached(key, &nonce, &aad, &mut empty, tag).ok()?;
    Some(delta)
}

/// The receiver's wake instant, as the sender estimates it from an
/// accepted acknowledgement: `sent_sfd − delta` (P6).
#[must_use]
pub fn learn_phase(sent_sfd: Ticks, delta: u8) -> Ticks {
    sent_sfd.wrapping_sub(u32::from(delta))
}

/// Decide how long to defer the first strobe transmission given a
/// possibly-stale phase estimate (§4.5.2 step 1). Returns `None` when the
/// estimate is missing, stale, or has grown too uncertain to trust —
/// callers should fall back to a full wake-interval strobe in that case.
#[must_use]
pub fn strobe_defer_ticks(
    phase: &PhaseLock,
    now_secs: u32,
    timing: &TimingConfig,
    update_threshold_secs: u32,
) -> Option<Ticks> {
    if phase.is_stale(now_secs, update_threshold_secs) {
        return None;
    }
    let instant = phase.instant()?;
    let age_secs = phase.age_secs(now_secs);
    let uncertainty = age_secs.saturating_mul(timing.phase_lock_freq_tolerance);
    if uncertainty > timing.wake_interval / 2 {
        return None;
    }
    Some(instant.saturating_sub(timing.phase_lock_guard_time + uncertainty))
}

// ---------------------------------------------------------------------
// Duty cycle (receiver side, §4.5.1)
// ---------------------------------------------------------------------

/// Phase of the receive-side wake-up state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyCycleState {
    Cca1,
    Cca2,
    FastSleepDozing,
    FastSleepRecheck,
    WaitingShr,
    WaitingFifop,
    WaitingFinalFifop,
    Done,
}

/// What the duty-cycle engine needs the driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyCycleAction {
    PerformCca,
    ArmTimer(Ticks),
    EnableShrSearch,
    RunOtpFramer,
    ArmFinalFifop,
    DecideAck,
    ReadAndVerifyRemainder,
    DisableAndFlush,
    WakeEnded,
}

/// Input delivered to [`DutyCycleMachine::step`].
#[derive(Debug, Clone, Copy)]
pub enum DutyCycleInput {
    Radio(RadioEvent),
    TimerFired,
}

/// One wake-up's receive-side state, re-entered by radio and timer events
/// (§4.5.1, §9).
pub struct DutyCycleMachine {
    state: DutyCycleState,
    noise_elapsed: Ticks,
}

impl DutyCycleMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DutyCycleState::Cca1,
            noise_elapsed: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> DutyCycleState {
        self.state
    }

    /// Advance the machine by one event, returning the action the driver
    /// should take. A `None` result means this input was not meaningful
    /// in the current state and can be ignored.
    pub fn step(&mut self, input: DutyCycleInput, timing: &TimingConfig) -> Option<DutyCycleAction> {
        match (self.state, input) {
            (DutyCycleState::Cca1, DutyCycleInput::TimerFired) => {
                Some(DutyCycleAction::PerformCca)
            }
            (DutyCycleState::Cca1, DutyCycleInput::Radio(RadioEvent::Error)) => {
                // Modeled as a CCA result delivered out-of-band by the
                // caller via `observe_cca`; Error here just means give up.
                self.state = DutyCycleState::Done;
                Some(DutyCycleAction::WakeEnded)
            }
            (DutyCycleState::WaitingShr, DutyCycleInput::Radio(RadioEvent::Sfd { .. })) => {
                self.state = DutyCycleState::WaitingFifop;
                Some(DutyCycleAction::ArmTimer(timing.guard_time))
            }
            (DutyCycleState::WaitingShr, DutyCycleInput::TimerFired) => {
                // T_i + T_shr + 1 elapsed with no SHR: end the wake.
                self.state = DutyCycleState::Done;
                Some(DutyCycleAction::WakeEnded)
            }
            (DutyCycleState::WaitingFifop, DutyCycleInput::Radio(RadioEvent::Fifop)) => {
                Some(DutyCycleAction::RunOtpFramer)
            }
            (DutyCycleState::WaitingFifop, DutyCycleInput::Radio(RadioEvent::Error)) => {
                self.state = DutyCycleState::Done;
                Some(DutyCycleAction::DisableAndFlush)
            }
            (DutyCycleState::WaitingFinalFifop, DutyCycleInput::Radio(RadioEvent::FinalFifop)) => {
                self.state = DutyCycleState::Done;
                Some(DutyCycleAction::ReadAndVerifyRemainder)
            }
            (DutyCycleState::FastSleepDozing, DutyCycleInput::TimerFired) => {
                self.noise_elapsed += timing.dozing_duration;
                if self.noise_elapsed >= timing.max_noise_window {
                    self.state = DutyCycleState::Done;
                    Some(DutyCycleAction::WakeEnded)
                } else {
                    self.state = DutyCycleState::FastSleepRecheck;
                    Some(DutyCycleAction::PerformCca)
                }
            }
            _ => None,
        }
    }

    /// Feed a CCA result into the machine. Called by the driver right
    /// after it performs the CCA the last `step` call requested.
    pub fn observe_cca(&mut self, result: CcaResult, timing: &TimingConfig) -> DutyCycleAction {
        match (self.state, result) {
            (DutyCycleState::Cca1, CcaResult::Clear) => {
                self.state = DutyCycleState::Cca2;
                DutyCycleAction::ArmTimer(timing.inter_cca_period)
            }
            (DutyCycleState::Cca2, CcaResult::Clear) => {
                self.state = DutyCycleState::Done;
                DutyCycleAction::WakeEnded
            }
            (_, CcaResult::Busy) => {
                self.state = DutyCycleState::FastSleepDozing;
                DutyCycleAction::ArmTimer(timing.dozing_duration)
            }
            (DutyCycleState::FastSleepRecheck, CcaResult::Clear) => {
                self.state = DutyCycleState::WaitingShr;
                DutyCycleAction::EnableShrSearch
            }
            _ => {
                self.state = DutyCycleState::Done;
                DutyCycleAction::WakeEnded
            }
        }
    }
}

impl Default for DutyCycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Strobing (sender side, §4.5.2)
// ---------------------------------------------------------------------

/// Phase of the strobe (sender-side transmit) state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrobeState {
    Deferred,
    Cca,
    Transmitting,
    WaitingAck,
    Finished(TxOutcome),
}

/// What the strobe machine needs the driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrobeAction {
    ArmTimer(Ticks),
    TurnOnAndCca,
    Transmit,
    ArmAckWindow(Ticks, Ticks),
    Done(TxOutcome),
}

/// One outbound frame's strobe, broadcast or unicast, re-entered by TXDONE
/// and ack-window events (§4.5.2).
pub struct StrobeMachine {
    state: StrobeState,
    broadcast: bool,
    strobe_count: u8,
    infinite_strobe: bool,
}

impl StrobeMachine {
    #[must_use]
    pub fn new(broadcast: bool, infinite_strobe: bool) -> Self {
        Self {
            state: StrobeState::Deferred,
            broadcast,
            strobe_count: 0,
            infinite_strobe,
        }
    }

    #[must_use]
    pub fn state(&self) -> StrobeState {
        self.state
    }

    #[must_use]
    pub fn strobe_count(&self) -> u8 {
        self.strobe_count
    }

    /// Begin the strobe loop: defer to the phase estimate if one is
    /// trustworthy, otherwise start CCA immediately.
    pub fn begin(
        &mut self,
        phase: Option<&PhaseLock>,
        now_secs: u32,
        timing: &TimingConfig,
        update_threshold_secs: u32,
    ) -> StrobeAction {
        let defer = phase.and_then(|p| strobe_defer_ticks(p, now_secs, timing, update_threshold_secs));
        match defer {
            Some(ticks) => {
                self.state = StrobeState::Deferred;
                StrobeAction::ArmTimer(ticks)
            }
            None => {
                self.state = StrobeState::Cca;
                StrobeAction::TurnOnAndCca
            }
        }
    }

    pub fn deferred_wait_elapsed(&mut self) -> StrobeAction {
        self.state = StrobeState::Cca;
        StrobeAction::TurnOnAndCca
    }

    pub fn observe_cca(&mut self, result: CcaResult) -> StrobeAction {
        match result {
            CcaResult::Clear => {
                self.state = StrobeState::Transmitting;
                StrobeAction::Transmit
            }
            CcaResult::Busy => {
                log::debug!("strobe ended: collision on cca");
                self.state = StrobeState::Finished(TxOutcome::Collision);
                StrobeAction::Done(TxOutcome::Collision)
            }
        }
    }

    /// TXDONE fired: for unicast, arm the acknowledgement window; for
    /// broadcast, the caller decides whether to keep strobing until the
    /// wake interval elapses (no ack is ever expected).
    pub fn observe_tx_done(&mut self, timing: &TimingConfig) -> StrobeAction {
        self.strobe_count = self.strobe_count.wrapping_add(1);
        if self.broadcast {
            self.state = StrobeState::Finished(TxOutcome::Ok);
            StrobeAction::Done(TxOutcome::Ok)
        } else {
            self.state = StrobeState::WaitingAck;
            StrobeAction::ArmAckWindow(timing.ack_window_min, timing.ack_window_max)
        }
    }

    /// An ack validated inside the window: strobe succeeds (unless
    /// `INFINITE_STROBE` is configured, in which case the caller may keep
    /// going — that policy lives above this machine).
    pub fn observe_ack(&mut self) -> StrobeAction {
        log::trace!("strobe finished: ack received after {} retransmissions", self.strobe_count);
        self.state = StrobeState::Finished(TxOutcome::Ok);
        StrobeAction::Done(TxOutcome::Ok)
    }

    /// The ack window elapsed with nothing valid received.
    pub fn observe_ack_timeout(&mut self) -> StrobeAction {
        if self.infinite_strobe {
            log::trace!("ack window elapsed, infinite_strobe configured, retrying");
            self.state = StrobeState::Cca;
            StrobeAction::TurnOnAndCca
        } else {
            log::debug!("strobe ended: no ack after {} retransmissions", self.strobe_count);
            self.state = StrobeState::Finished(TxOutcome::NoAck);
            StrobeAction::Done(TxOutcome::NoAck)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecLevel;

    #[test]
    fn ack_roundtrips_and_rejects_tampering() {
        let key = [9u8; 16];
        let receiver = [0x11u8, 0x22];
        let ack = build_ack(&key, 2, 37, &receiver, 5, SecLevel::Mic64).unwrap();
        assert_eq!(validate_ack(&key, &ack, 2, &receiver, 5, SecLevel::Mic64), Some(37));

        // A different strobe index changes the additional data and must
        // invalidate the tag (prevents accepting a delayed ack, §4.5.3).
        assert!(validate_ack(&key, &ack, 3, &receiver, 5, SecLevel::Mic64).is_none());
        assert!(validate_ack(&key, &ack, 2, &receiver, 6, SecLevel::Mic64).is_none());
    }

    #[test]
    fn learn_phase_subtracts_delta() {
        assert_eq!(learn_phase(1000, 40), 960);
    }

    /// Scenario 3 (§8): a fresh phase estimate yields a bounded, sub-wake
    /// defer; a stale one falls back to an immediate strobe.
    #[test]
    fn strobe_defer_falls_back_when_stale() {
        let timing = TimingConfig::approx(10_000);
        let mut phase = PhaseLock::unknown();
        phase.update(5000, 100);
        let fresh = strobe_defer_ticks(&phase, 100, &timing, 300);
        assert!(fresh.is_some());
        let stale = strobe_defer_ticks(&phase, 10_000, &timing, 300);
        assert!(stale.is_none());
    }

    #[test]
    fn strobe_machine_collision_then_success() {
        let timing = TimingConfig::approx(10_000);
        let mut machine = StrobeMachine::new(false, false);
        let action = machine.begin(None, 0, &timing, 300);
        assert_eq!(action, StrobeAction::TurnOnAndCca);
        let busy = machine.observe_cca(CcaResult::Busy);
        assert_eq!(busy, StrobeAction::Done(TxOutcome::Collision));

        let mut machine = StrobeMachine::new(false, false);
        machine.begin(None, 0, &timing, 300);
        machine.observe_cca(CcaResult::Clear);
        let armed = machine.observe_tx_done(&timing);
        assert!(matches!(armed, StrobeAction::ArmAckWindow(_, _)));
        let done = machine.observe_ack();
        assert_eq!(done, StrobeAction::Done(TxOutcome::Ok));
        assert_eq!(machine.strobe_count(), 1);
    }

    #[test]
    fn broadcast_strobe_finishes_on_first_tx_done_without_ack_wait() {
        let timing = TimingConfig::approx(10_000);
        let mut machine = StrobeMachine::new(true, false);
        machine.begin(None, 0, &timing, 300);
        machine.observe_cca(CcaResult::Clear);
        let action = machine.observe_tx_done(&timing);
        assert_eq!(action, StrobeAction::Done(TxOutcome::Ok));
    }

    #[test]
    fn ack_timeout_without_infinite_strobe_reports_no_ack() {
        let timing = TimingConfig::approx(10_000);
        let mut machine = StrobeMachine::new(false, false);
        machine.begin(None, 0, &timing, 300);
        machine.observe_cca(CcaResult::Clear);
        machine.observe_tx_done(&timing);
        let action = machine.observe_ack_timeout();
        assert_eq!(action, StrobeAction::Done(TxOutcome::NoAck));
    }

    #[test]
    fn duty_cycle_silence_on_both_ccas_ends_wake() {
        let timing = TimingConfig::approx(10_000);
        let mut machine = DutyCycleMachine::new();
        machine.step(DutyCycleInput::TimerFired, &timing);
        let action = machine.observe_cca(CcaResult::Clear, &timing);
        assert!(matches!(action, DutyCycleAction::ArmTimer(_)));
        let action = machine.observe_cca(CcaResult::Clear, &timing);
        assert_eq!(action, DutyCycleAction::WakeEnded);
    }

    #[test]
    fn duty_cycle_preamble_reaches_fifop_wait() {
        let timing = TimingConfig::approx(10_000);
        let mut machine = DutyCycleMachine::new();
        machine.observe_cca(CcaResult::Busy, &timing);
        machine.step(DutyCycleInput::TimerFired, &timing);
        let action = machine.observe_cca(CcaResult::Clear, &timing);
        assert_eq!(action, DutyCycleAction::EnableShrSearch);
        assert_eq!(machine.state(), DutyCycleState::WaitingShr);
        let action = machine.step(DutyCycleInput::Radio(RadioEvent::Sfd { at: 10 }), &timing);
        assert!(matches!(action, Some(DutyCycleAction::ArmTimer(_))));
        assert_eq!(machine.state(), DutyCycleState::WaitingFifop);
    }
}
