// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framer chain (C8).
//!
//! Glue sequencing header create/parse calls across the OTP framer (C5)
//! and a per-radio PHY framer. Composition order is fixed (§4.6):
//! outbound is upper → security → OTP → PHY; inbound is the exact
//! reverse. Each stage contributes bytes or fails outright — there is no
//! partial result to recover from a failed stage, since a stage further
//! up the chain must never see payload bytes the OTP framer has not yet
//! authenticated.

use crate::addr::LinkAddr;
use crate::nbr::NeighborTable;
use crate::otp::{FrameType, OtpContext, OtpFramer, ValidatedFrame, OTP_LEN};
use crate::radio::MAX_FRAME_LEN;

/// The per-radio stage below the OTP framer: channel CRC and PHY header
/// (length byte, preamble). Out of scope (§1) beyond this seam — a
/// concrete implementation wraps the platform radio driver's own framing.
pub trait PhyFramer {
    /// Append this stage's trailer (e.g. a CRC) after `payload_len` bytes
    /// already written into `out`, returning the total frame length, or
    /// `None` if `out` cannot hold it.
    fn finish_outbound(&self, out: &mut [u8], payload_len: usize) -> Option<usize>;

    /// Strip this stage's own header/trailer from a raw buffered frame,
    /// returning the slice to hand up to the OTP framer. Returning `None`
    /// means PHY-level validation (e.g. CRC) failed.
    fn strip_inbound<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]>;
}

/// A framer chain with no PHY-level trailer, for platforms whose radio
/// hardware validates CRC before bytes ever reach software.
pub struct NoOpPhy;

impl PhyFramer for NoOpPhy {
    fn finish_outbound(&self, _out: &mut [u8], payload_len: usize) -> Option<usize> {
        Some(payload_len)
    }

    fn strip_inbound<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]> {
        Some(raw)
    }
}

/// A fully assembled outbound frame, ready for [`crate::radio::Radio::prepare`].
pub struct OutboundFrame {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl OutboundFrame {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// An inbound frame that has cleared both PHY validation and OTP header
/// authentication, with the still-unverified payload upper layers must
/// not trust any further than the OTP framer's own guarantees extend.
pub struct InboundFrame {
    pub header: ValidatedFrame,
    pub payload_offset: usize,
}

/// Sequences the OTP framer against a [`PhyFramer`] in the fixed order
/// required by §4.6.
pub struct FramerChain<P: PhyFramer> {
    otp: OtpFramer,
    phy: P,
}

impl<P: PhyFramer> FramerChain<P> {
    #[must_use]
    pub fn new(otp: OtpFramer, phy: P) -> Self {
        Self { otp, phy }
    }

    #[must_use]
    pub fn otp(&self) -> &OtpFramer {
        &self.otp
    }

    #[must_use]
    pub fn otp_mut(&mut self) -> &mut OtpFramer {
        &mut self.otp
    }

    /// Outbound: upper → security(OTP) → PHY. `payload` is the
    /// already-secured upper-layer body (C2's job, done before this
    /// call); this stage only writes the OTP header in front of it and
    /// lets the PHY stage close out the frame.
    pub fn build_outbound(
        &self,
        frame_type: FrameType,
        src_addr: &LinkAddr,
        counter: u32,
        ctx: &OtpContext<'_>,
        payload: &[u8],
    ) -> Option<OutboundFrame> {
        let mut bytes = [0u8; MAX_FRAME_LEN];
        let header_len = self.otp.create_header(&mut bytes, frame_type, src_addr, counter, ctx)?;
        let end = header_len + payload.len();
        if end > bytes.len() {
            return None;
        }
        bytes[header_len..end].copy_from_slice(payload);
        let len = self.phy.finish_outbound(&mut bytes, end)?;
        Some(OutboundFrame { bytes, len })
    }

    /// Inbound: PHY → security(OTP) → upper, the exact reverse of
    /// outbound. A `None` at either stage drops the frame silently — per
    /// the crate's error taxonomy, per-frame rejection is never a typed
    /// error (§4.1, `crate::error`).
    pub fn parse_inbound<'a>(
        &mut self,
        raw: &'a [u8],
        local_addr: &LinkAddr,
        table: &NeighborTable,
    ) -> Option<(InboundFrame, &'a [u8])> {
        let stripped = self.phy.strip_inbound(raw)?;
        let header = self.otp.validate(stripped, local_addr, table)?;
        let payload_offset = header.header_len;
        Some((
            InboundFrame {
                header,
                payload_offset,
            },
            stripped,
        ))
    }
}

/// Minimum bytes the PHY layer must deliver at FIFOP before the OTP
/// framer can even attempt validation: the fixed header less the
/// trailing strobe-index byte, since that arrives with the rest of the
/// frame (§4.1 step 1 assumes at least this much is already buffered).
#[must_use]
pub fn min_header_prefix(addr_len: usize, counter_len: usize) -> usize {
    1 + addr_len + counter_len + OTP_LEN
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
    fn outbound_then_inbound_roundtrips_payload() {
        let group_key = [7u8; 16];
        let otp = OtpFramer::new([9u8; 16], Some(group_key), 2, 1);
        let mut chain = FramerChain::new(otp, NoOpPhy);

        let src = LinkAddr::from_slice(&[0xAB, 0xCD]).unwrap();
        let local = LinkAddr::from_slice(&[0x11, 0x22]).unwrap();
        let ctx = OtpContext::Normal {
            receiver: LinkAddr::broadcast(2),
            group_key: &group_key,
        };
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let frame = chain
            .build_outbound(FrameType::Hello, &src, 1, &ctx, &payload)
            .unwrap();

        let table = table();
        let (parsed, stripped) = chain.parse_inbound(frame.as_slice(), &local, &table).unwrap();
        assert_eq!(parsed.header.src_addr, src);
        assert_eq!(parsed.header.counter, 1);
        assert_eq!(&stripped[parsed.payload_offset..], &payload);
    }

    #[test]
    fn phy_rejection_never_reaches_otp_stage() {
        struct AlwaysFail;
        impl PhyFramer for AlwaysFail {
            fn finish_outbound(&self, _out: &mut [u8], len: usize) -> Option<usize> {
                Some(len)
            }
            fn strip_inbound<'a>(&self, _raw: &'a [u8]) -> Option<&'a [u8]> {
                None
            }
        }

        let otp = OtpFramer::new([9u8; 16], Some([1u8; 16]), 2, 1);
        let mut chain = FramerChain::new(otp, AlwaysFail);
        let local = LinkAddr::from_slice(&[0x11, 0x22]).unwrap();
        let table = table();
        assert!(chain.parse_inbound(&[0u8; 16], &local, &table).is_none());
    }

    #[test]
    fn oversize_payload_is_rejected_before_phy_stage() {
        let otp = OtpFramer::new([9u8; 16], Some([1u8; 16]), 2, 1);
        let chain = FramerChain::new(otp, NoOpPhy);
        let src = LinkAddr::from_slice(&[0xAB, 0xCD]).unwrap();
        let ctx = OtpContext::Normal {
            receiver: LinkAddr::broadcast(2),
            group_key: &[1u8; 16],
        };
        let huge = [0u8; MAX_FRAME_LEN];
        assert!(chain.build_outbound(FrameType::Hello, &src, 1, &ctx, &huge).is_none());
    }
}
