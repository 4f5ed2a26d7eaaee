// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Neighbor table (C4, "AKR-NT").
//!
//! A fixed-capacity pool of entries, each holding up to two records (§3).
//! Capacity is a compile-time bound ([`MAX_NEIGHBORS`]); `Config::max_neighbors`
//! is a runtime cap that must not exceed it, checked at table construction.

mod record;

pub use record::{PhaseLock, TentativeRecord, TentativeStatus, TentativeVariant, CHALLENGE_LEN};

use crate::addr::LinkAddr;
use crate::config::Config;
use crate::error::{Error, Result};
use record::PermanentRecord;

/// Compile-time pool capacity. `Config::max_neighbors` (a runtime value,
/// defaulted from the external interface's formula) must not exceed this;
/// see `DESIGN.md` for why the pool itself is sized at compile time.
pub const MAX_NEIGHBORS: usize = 64;

/// Which record of an entry an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Permanent,
    Tentative,
}

/// One neighbor, identified by link address, holding up to one of each
/// record kind (§3) plus the locally-assigned compact index (I4).
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub addr: LinkAddr,
    pub local_index: u8,
    pub permanent: Option<PermanentRecord>,
    pub tentative: Option<TentativeRecord>,
}

impl NeighborEntry {
    /// P1: an entry with no record at all is not a valid resting state —
    /// callers must release the slot as soon as both go null.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.permanent.is_none() && self.tentative.is_none()
    }
}

/// A value that has passed through C2's authentication before reaching
/// here — the type the framer chain constructs, and the only way
/// [`NeighborTable::update`] can be called, closing the authenticate-
/// before-update gap described in §4.3.1.
pub struct Authenticated<T>(T);

impl<T> Authenticated<T> {
    /// Only the post-authentication call site (the framer chain, C8)
    /// should construct one of these; nothing about this type prevents
    /// other in-crate code from doing so, but callers that do are
    /// asserting they have actually verified the frame's MIC.
    pub(crate) fn assert_authenticated(value: T) -> Self {
        Self(value)
    }
}

/// The authenticated fields `update` is allowed to write.
#[derive(Debug, Clone, Copy)]
pub struct UpdatePayload {
    pub foreign_index: u8,
}

/// The fixed-capacity neighbor table.
pub struct NeighborTable {
    entries: [Option<NeighborEntry>; MAX_NEIGHBORS],
    max_neighbors: usize,
    max_tentatives: usize,
    lifetime_secs: u32,
    suppression_enabled: bool,
    lock: TableLock,
}

impl NeighborTable {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config.max_neighbors` exceeds
    /// the compiled-in pool capacity.
    pub fn new(config: &Config) -> Result<Self> {
        if config.max_neighbors as usize > MAX_NEIGHBORS {
            return Err(Error::InvalidConfig("max_neighbors exceeds compiled-in pool capacity"));
        }
        Ok(Self {
            entries: core::array::from_fn(|_| None),
            max_neighbors: config.max_neighbors as usize,
            max_tentatives: config.max_tentatives as usize,
            lifetime_secs: config.lifetime_secs,
            suppression_enabled: true,
            lock: TableLock::new(),
        })
    }

    /// Attempt to take the table's non-blocking lock (§4.3, §5).
    ///
    /// The SDE's hot path must call this before parsing or mutating table
    /// state and simply drop the frame on `None` rather than wait.
    pub fn try_lock(&self) -> Option<TableGuard<'_>> {
        self.lock.try_acquire()
    }

    /// Iterate all occupied entries (generalizes the source's manual
    /// `head`/`next` linked-list traversal to Rust's `Iterator`).
    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.iter().filter_map(Option::as_ref)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut NeighborEntry> {
        self.entries.iter_mut().filter_map(Option::as_mut)
    }

    /// Count entries holding a record of the given kind (P2 checks this
    /// against `max_tentatives` for [`RecordKind::Tentative`]).
    #[must_use]
    pub fn count(&self, kind: RecordKind) -> usize {
        self.iter()
            .filter(|e| match kind {
                RecordKind::Permanent => e.permanent.is_some(),
                RecordKind::Tentative => e.tentative.is_some(),
            })
            .count()
    }

    /// Look up an entry by the address that sent the frame being parsed
    /// (inbound path). Identical lookup to
    /// [`Self::get_by_receiver_addr`]; kept as a distinct name because the
    /// two call sites (receive vs. transmit) read the same table for
    /// different reasons.
    #[must_use]
    pub fn get_by_sender_addr(&self, addr: &LinkAddr) -> Option<&NeighborEntry> {
        self.iter().find(|e| &e.addr == addr)
    }

    /// Look up an entry by the address a frame is being sent to (outbound
    /// path). See [`Self::get_by_sender_addr`].
    #[must_use]
    pub fn get_by_receiver_addr(&self, addr: &LinkAddr) -> Option<&NeighborEntry> {
        self.get_by_sender_addr(addr)
    }

    pub fn get_mut(&mut self, addr: &LinkAddr) -> Option<&mut NeighborEntry> {
        self.iter_mut().find(|e| &e.addr == addr)
    }

    /// Smallest nonnegative integer not currently used as a local index by
    /// any entry (I4), scanned fresh on every call per the source's
    /// algorithm — the table is small enough that this is cheap.
    fn next_local_index(&self) -> Option<u8> {
        let mut used: u64 = 0;
        for entry in self.iter() {
            used |= 1u64 << entry.local_index;
        }
        for candidate in 0..MAX_NEIGHBORS as u32 {
            if used & (1 << candidate) == 0 {
                return Some(candidate as u8);
            }
        }
        None
    }

    fn free_slot(&mut self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    /// Create a new entry for `addr` with a fresh tentative challenge
    /// record, or return the existing entry's tentative slot if present.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyTentatives`] if `max_tentatives` concurrent
    /// tentative records already exist table-wide (P2).
    /// [`Error::TableFull`] if no free slot remains and `addr` has no
    /// existing entry.
    pub fn new_tentative(
        &mut self,
        addr: LinkAddr,
        now_secs: u32,
        challenge: [u8; CHALLENGE_LEN],
        cached_otp: [u8; 3],
    ) -> Result<&NeighborEntry> {
        if self.count(RecordKind::Tentative) >= self.max_tentatives {
            log::debug!("tentative admission refused, table already at max_tentatives");
            return Err(Error::TooManyTentatives);
        }
        let expiration = now_secs + self.lifetime_secs;
        let record = TentativeRecord::new_challenge(challenge, expiration, cached_otp);

        if let Some(pos) = self.entries.iter().position(|e| {
            e.as_ref().is_some_and(|e| e.addr == addr)
        }) {
            let entry = self.entries[pos].as_mut().expect("position found above");
            entry.tentative = Some(record);
            return Ok(self.entries[pos].as_ref().expect("just written"));
        }

        if self.count(RecordKind::Permanent) + self.count(RecordKind::Tentative)
            >= self.max_neighbors
        {
            return Err(Error::TableFull);
        }
        let slot = self.free_slot().ok_or(Error::TableFull)?;
        let local_index = self.next_local_index().ok_or(Error::TableFull)?;
        log::trace!("admitting tentative neighbor at local index {local_index}");
        self.entries[slot] = Some(NeighborEntry {
            addr,
            local_index,
            permanent: None,
            tentative: Some(record),
        });
        Ok(self.entries[slot].as_ref().expect("just written"))
    }

    /// Transition `addr`'s tentative record from awaiting-HELLOACK to
    /// awaiting-ACK (§4.2), storing the pending pairwise key (if any) and
    /// the OTP the closing ACK must carry.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `addr` has no tentative record.
    pub fn mark_awaiting_ack(
        &mut self,
        addr: &LinkAddr,
        variant: TentativeVariant,
        cached_otp: [u8; 3],
    ) -> Result<()> {
        let entry = self
            .get_mut(addr)
            .ok_or(Error::InvalidConfig("mark_awaiting_ack: no such neighbor"))?;
        let tentative = entry
            .tentative
            .as_mut()
            .ok_or(Error::InvalidConfig("mark_awaiting_ack: no tentative record"))?;
        tentative.status = TentativeStatus::TentativeAwaitingAck;
        tentative.variant = variant;
        tentative.cached_otp = cached_otp;
        Ok(())
    }

    /// Create a permanent record directly, with no preceding tentative
    /// stage (§4.2): the role in the handshake that receives the
    /// HELLOACK already holds enough authenticated state (both challenges
    /// plus the pre-shared secret) to trust the peer immediately, so it
    /// never needs an intermediate tentative record at all.
    ///
    /// # Errors
    ///
    /// [`Error::TableFull`] if no slot is available.
    pub fn new_permanent(
        &mut self,
        addr: LinkAddr,
        foreign_index: u8,
        pairwise_key: Option<crate::crypto::Key>,
        group_key: Option<crate::crypto::Key>,
        now_secs: u32,
    ) -> Result<()> {
        if let Some(entry) = self.get_mut(&addr) {
            let mut record =
                PermanentRecord::new(foreign_index, now_secs + self.lifetime_secs, self.suppression_enabled);
            record.pairwise_key = pairwise_key;
            record.group_key = group_key;
            entry.permanent = Some(record);
            entry.tentative = None;
            return Ok(());
        }
        if self.count(RecordKind::Permanent) + self.count(RecordKind::Tentative) >= self.max_neighbors {
            return Err(Error::TableFull);
        }
        let slot = self.free_slot().ok_or(Error::TableFull)?;
        let local_index = self.next_local_index().ok_or(Error::TableFull)?;
        let mut record =
            PermanentRecord::new(foreign_index, now_secs + self.lifetime_secs, self.suppression_enabled);
        record.pairwise_key = pairwise_key;
        record.group_key = group_key;
        self.entries[slot] = Some(NeighborEntry {
            addr,
            local_index,
            permanent: Some(record),
            tentative: None,
        });
        Ok(())
    }

    /// Promote `addr`'s tentative record to permanent (§4.2, I1/P5), with
    /// the given initial keys and foreign index.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `addr` has no tentative record to
    /// promote (the caller should have checked via
    /// [`Self::get_by_sender_addr`] first; this is a logic-bug guard, not
    /// part of the normal handshake error taxonomy).
    pub fn promote(
        &mut self,
        addr: &LinkAddr,
        foreign_index: u8,
        pairwise_key: Option<crate::crypto::Key>,
        group_key: Option<crate::crypto::Key>,
        now_secs: u32,
    ) -> Result<()> {
        let entry = self.get_mut(addr).ok_or(Error::InvalidConfig("promote: no such neighbor"))?;
        if entry.tentative.is_none() {
            return Err(Error::InvalidConfig("promote: no tentative record"));
        }
        let mut record =
            PermanentRecord::new(foreign_index, now_secs + self.lifetime_secs, self.suppression_enabled);
        record.pairwise_key = pairwise_key;
        record.group_key = group_key;
        entry.permanent = Some(record);
        entry.tentative = None;
        log::debug!("handshake complete, promoted tentative record to permanent");
        Ok(())
    }

    /// Delete the given record kind from `addr`'s entry; releases the
    /// whole slot once both records are null (§4.3 deletion policy).
    pub fn delete(&mut self, addr: &LinkAddr, kind: RecordKind) {
        let mut release = false;
        if let Some(entry) = self.get_mut(addr) {
            match kind {
                RecordKind::Permanent => entry.permanent = None,
                RecordKind::Tentative => entry.tentative = None,
            }
            release = entry.is_empty();
        }
        if release {
            if let Some(slot) = self
                .entries
                .iter()
                .position(|e| e.as_ref().is_some_and(|e| &e.addr == addr))
            {
                self.entries[slot] = None;
            }
        }
    }

    /// Sweep the table removing tentative records past their
    /// `expiration_time` (scenario 6), releasing slots that become empty.
    pub fn delete_expired_tentatives(&mut self, now_secs: u32) {
        let expired_addrs: heapless::Vec<LinkAddr, MAX_NEIGHBORS> = self
            .iter()
            .filter(|e| e.tentative.as_ref().is_some_and(|t| t.is_expired(now_secs)))
            .map(|e| e.addr)
            .collect();
        for addr in expired_addrs {
            log::trace!("evicting expired tentative record");
            self.delete(&addr, RecordKind::Tentative);
        }
    }

    /// True if `addr`'s permanent record has passed its expiration time.
    #[must_use]
    pub fn is_expired(&self, addr: &LinkAddr, now_secs: u32) -> bool {
        self.get_by_sender_addr(addr)
            .and_then(|e| e.permanent.as_ref())
            .is_some_and(|p| now_secs >= p.expiration_time)
    }

    /// Extend a permanent record's expiration in response to accepted
    /// traffic, honoring the direction-change rule of §4.4.
    pub fn prolong(&mut self, addr: &LinkAddr, direction: crate::replay::Direction, now_secs: u32) {
        let lifetime = self.lifetime_secs;
        if let Some(entry) = self.get_mut(addr) {
            if let Some(permanent) = entry.permanent.as_mut() {
                if permanent.replay.should_prolong(direction) {
                    permanent.expiration_time = now_secs + lifetime;
                }
            }
        }
    }

    /// Write the peer's local index into `addr`'s permanent record.
    ///
    /// Only reachable with an [`Authenticated`] payload (§4.3.1): the
    /// framer chain must verify the frame's MIC via C2 before it can
    /// construct one.
    pub fn update(&mut self, addr: &LinkAddr, payload: Authenticated<UpdatePayload>) {
        if let Some(entry) = self.get_mut(addr) {
            if let Some(permanent) = entry.permanent.as_mut() {
                permanent.foreign_index = payload.0.foreign_index;
            }
        }
    }
}

/// Non-blocking fail-closed lock guarding table mutation (§4.3, §5).
///
/// Mirrors [`crate::crypto::CipherLock`] — kept as an independent type
/// because the two protect unrelated pieces of shared state and the
/// source's two global locks (the AKES neighbor-list lock and the cipher
/// lock) are likewise independent.
pub struct TableLock {
    held: core::sync::atomic::AtomicBool,
}

impl TableLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn try_acquire(&self) -> Option<TableGuard<'_>> {
        self.held
            .compare_exchange(
                false,
                true,
                core::sync::atomic::Ordering::Acquire,
                core::sync::atomic::Ordering::Relaxed,
            )
            .ok()
            .map(|()| TableGuard { lock: self })
    }
}

impl Default for TableLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TableGuard<'a> {
    lock: &'a TableLock,
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, core::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::builder()
            .wake_interval_ticks(512)
            .max_neighbors(8)
            .build()
            .unwrap()
    }

    fn addr(byte: u8) -> LinkAddr {
        LinkAddr::from_slice(&[byte, 0]).unwrap()
    }

    #[test]
    fn new_tentative_assigns_smallest_free_index() {
        let mut table = NeighborTable::new(&test_config()).unwrap();
        let a = table.new_tentative(addr(1), 0, [0; 8], [0; 3]).unwrap();
        assert_eq!(a.local_index, 0);
        let b = table.new_tentative(addr(2), 0, [0; 8], [0; 3]).unwrap();
        assert_eq!(b.local_index, 1);
        table.delete(&addr(1), RecordKind::Tentative);
        let c = table.new_tentative(addr(3), 0, [0; 8], [0; 3]).unwrap();
        assert_eq!(c.local_index, 0, "index 0 must be reused once freed (I4)");
    }

    #[test]
    fn tentative_cap_enforced_p2() {
        let config = Config::builder()
            .wake_interval_ticks(512)
            .max_tentatives(2)
            .max_neighbors(8)
            .build()
            .unwrap();
        let mut table = NeighborTable::new(&config).unwrap();
        table.new_tentative(addr(1), 0, [0; 8], [0; 3]).unwrap();
        table.new_tentative(addr(2), 0, [0; 8], [0; 3]).unwrap();
        let result = table.new_tentative(addr(3), 0, [0; 8], [0; 3]);
        assert!(matches!(result, Err(Error::TooManyTentatives)));
    }

    #[test]
    fn promote_moves_tentative_to_permanent_p5() {
        let mut table = NeighborTable::new(&test_config()).unwrap();
        table.new_tentative(addr(1), 0, [0; 8], [0; 3]).unwrap();
        table.promote(&addr(1), 7, Some([1; 16]), None, 0).unwrap();
        let entry = table.get_by_sender_addr(&addr(1)).unwrap();
        assert!(entry.permanent.is_some());
        assert!(entry.tentative.is_none());
    }

    #[test]
    fn empty_entry_releases_its_slot() {
        let mut table = NeighborTable::new(&test_config()).unwrap();
        table.new_tentative(addr(1), 0, [0; 8], [0; 3]).unwrap();
        table.delete(&addr(1), RecordKind::Tentative);
        assert!(table.get_by_sender_addr(&addr(1)).is_none());
        assert_eq!(table.count(RecordKind::Tentative), 0);
    }

    #[test]
    fn expired_tentatives_are_swept() {
        let mut table = NeighborTable::new(&test_config()).unwrap();
        table.new_tentative(addr(1), 0, [0; 8], [0; 3]).unwrap();
        table.delete_expired_tentatives(10_000_000);
        assert!(table.get_by_sender_addr(&addr(1)).is_none());
    }

    #[test]
    fn update_requires_authenticated_payload() {
        let mut table = NeighborTable::new(&test_config()).unwrap();
        table.new_tentative(addr(1), 0, [0; 8], [0; 3]).unwrap();
        table.promote(&addr(1), 3, None, Some([2; 16]), 0).unwrap();
        let payload = Authenticated::assert_authenticated(UpdatePayload { foreign_index: 9 });
        table.update(&addr(1), payload);
        let entry = table.get_by_sender_addr(&addr(1)).unwrap();
        assert_eq!(entry.permanent.as_ref().unwrap().foreign_index, 9);
    }

    #[test]
    fn table_lock_is_non_blocking_and_fail_closed() {
        let table = NeighborTable::new(&test_config()).unwrap();
        let first = table.try_lock();
        assert!(first.is_some());
        assert!(table.try_lock().is_none());
    }
}
