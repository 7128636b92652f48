//! Placeholder ids for notes created while offline.
//!
//! Temp ids are negated microsecond timestamps, so they never collide with
//! server ids (always positive) and ids from an earlier run of the process
//! are older, hence numerically larger, than anything issued now.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use crate::storage::NoteId;

/// Last id handed out in this process
static LAST_ISSUED: AtomicI64 = AtomicI64::new(0);

/// Allocate a new temp id, strictly below every id issued before it
pub fn allocate() -> NoteId {
    let candidate = -Utc::now().timestamp_micros().max(1);
    let mut last = LAST_ISSUED.load(Ordering::Relaxed);
    loop {
        let next = candidate.min(last - 1);
        match LAST_ISSUED.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return NoteId(next),
            Err(actual) => last = actual,
        }
    }
}

pub fn is_temp(id: NoteId) -> bool {
    id.is_temp()
}
