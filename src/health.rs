use std::sync::atomic::{AtomicI64, Ordering};

const UNREPORTED: i64 = -1;

/// Link status reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Down = 0,
    Up = 1,
}

impl LinkStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Process-wide health shared by the status dispatcher and the scrape path.
///
/// Each field is a single scalar for the whole process. Updates from
/// different connections overwrite each other, so the bus state reflects
/// whichever connection reported last, not an aggregate across endpoints.
///
/// The document store state stays unreported until a writer records an
/// outcome. Nothing in this crate writes documents, so it is only set by an
/// embedding process that forwards events downstream.
#[derive(Debug)]
pub struct HealthRecord {
    bus_connectivity: AtomicI64,
    doc_store_state: AtomicI64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            bus_connectivity: AtomicI64::new(LinkStatus::Down.as_i64()),
            doc_store_state: AtomicI64::new(UNREPORTED),
        }
    }
}

impl HealthRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest status observed from any connection.
    pub fn set_bus_status(&self, status: LinkStatus) {
        self.bus_connectivity
            .store(status.as_i64(), Ordering::Relaxed);
    }

    pub fn bus_connectivity(&self) -> i64 {
        self.bus_connectivity.load(Ordering::Relaxed)
    }

    /// Record the outcome of the most recent downstream document write.
    pub fn set_doc_store_state(&self, ok: bool) {
        self.doc_store_state
            .store(i64::from(ok), Ordering::Relaxed);
    }

    /// 1 or 0 for the last recorded write, `None` before any was recorded.
    pub fn doc_store_state(&self) -> Option<i64> {
        match self.doc_store_state.load(Ordering::Relaxed) {
            UNREPORTED => None,
            state => Some(state),
        }
    }
}
