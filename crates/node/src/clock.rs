//! Wall-clock sanity check.  Synchronisation itself is the OS's job; the node
//! only reports when the clock is obviously unsynchronised.

use thiserror::Error;
use time::OffsetDateTime;

/// 2024-01-01T00:00:00Z.  Any earlier reading means the clock was never set.
const EARLIEST_PLAUSIBLE_UNIX: i64 = 1_704_067_200;

#[derive(Debug, Error)]
#[error("system clock not synchronised (reads {now})")]
pub struct TimeSyncFault {
    pub now: OffsetDateTime,
}

pub fn check_sync() -> Result<OffsetDateTime, TimeSyncFault> {
    check_at(OffsetDateTime::now_utc())
}

fn check_at(now: OffsetDateTime) -> Result<OffsetDateTime, TimeSyncFault> {
    if now.unix_timestamp() < EARLIEST_PLAUSIBLE_UNIX {
        Err(TimeSyncFault { now })
    } else {
        Ok(now)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
