//! Per-span bookkeeping: the resolution state machine and the in-memory table
//! the resolver drives.

pub mod manager;
pub mod reader;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::ztoc::{SpanId, SpanInfo, Ztoc};

/// Resolution progress of one span. States only advance
/// (`Unrequested → Requested → Fetched → Uncompressed`), except for the
/// privileged rollback a failed fetch applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SpanState {
    /// Nothing has happened to this span yet.
    Unrequested = 0,
    /// A claimant is fetching the compressed bytes.
    Requested = 1,
    /// Compressed bytes are verified and cached.
    Fetched = 2,
    /// Uncompressed bytes are cached.
    Uncompressed = 3,
}

impl SpanState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SpanState::Unrequested,
            1 => SpanState::Requested,
            2 => SpanState::Fetched,
            _ => SpanState::Uncompressed,
        }
    }
}

impl fmt::Display for SpanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpanState::Unrequested => "unrequested",
            SpanState::Requested => "requested",
            SpanState::Fetched => "fetched",
            SpanState::Uncompressed => "uncompressed",
        };
        f.write_str(name)
    }
}

/// Check one edge of the state machine. Self-loops are idempotent no-ops and
/// always legal. Rollback is not in this table; the failure path applies it
/// without validation.
pub fn validate_transition(from: SpanState, to: SpanState) -> Result<()> {
    use SpanState::*;
    let legal = matches!(
        (from, to),
        (Unrequested, Unrequested)
            | (Unrequested, Requested)
            | (Requested, Requested)
            | (Requested, Fetched)
            | (Fetched, Fetched)
            | (Fetched, Uncompressed)
            | (Uncompressed, Uncompressed)
    );
    if legal {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition { from, to })
    }
}

/// One slot of the span table. The state is read lock-free on the fast path;
/// all mutation happens while holding `gate`, which doubles as the barrier
/// that parks concurrent resolvers of the same span behind the claimant.
pub(crate) struct SpanRecord {
    state: AtomicU8,
    pub(crate) gate: Mutex<()>,
    pub(crate) start_comp_offset: u64,
    pub(crate) end_comp_offset: u64,
    pub(crate) start_uncomp_offset: u64,
    pub(crate) end_uncomp_offset: u64,
    pub(crate) digest: String,
}

impl SpanRecord {
    fn new(info: &SpanInfo) -> Self {
        Self {
            state: AtomicU8::new(SpanState::Unrequested as u8),
            gate: Mutex::new(()),
            start_comp_offset: info.start_comp_offset,
            end_comp_offset: info.end_comp_offset,
            start_uncomp_offset: info.start_uncomp_offset,
            end_uncomp_offset: info.end_uncomp_offset,
            digest: info.digest.clone(),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> SpanState {
        SpanState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state machine, rejecting illegal edges. Callers hold the
    /// gate, so load-validate-store does not race with other writers.
    pub(crate) fn transition(&self, to: SpanState) -> Result<()> {
        let from = self.state();
        validate_transition(from, to)?;
        self.state.store(to as u8, Ordering::Release);
        Ok(())
    }

    /// Privileged reset to `Unrequested` after a failed or abandoned fetch,
    /// opening the next resolution generation.
    pub(crate) fn rollback(&self) {
        trace!(digest = %self.digest, "rolling span back to unrequested");
        self.state
            .store(SpanState::Unrequested as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn compressed_len(&self) -> u64 {
        self.end_comp_offset - self.start_comp_offset
    }

    #[inline]
    pub(crate) fn uncompressed_len(&self) -> u64 {
        self.end_uncomp_offset - self.start_uncomp_offset
    }
}

/// Array of span records indexed by [`SpanId`], built once from the ZToC.
pub(crate) struct SpanTable {
    records: Vec<SpanRecord>,
}

impl SpanTable {
    pub(crate) fn from_ztoc(ztoc: &Ztoc) -> Self {
        Self {
            records: ztoc.spans().iter().map(SpanRecord::new).collect(),
        }
    }

    pub(crate) fn get(&self, id: SpanId) -> Option<&SpanRecord> {
        self.records.get(id as usize)
    }
}
