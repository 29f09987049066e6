//! Seeding progress reporting — lightweight messages sent from the seed
//! thread to the caller via a crossbeam channel.

use std::time::Duration;

/// Progress updates sent while a volume is being seeded from a host
/// directory. The volume itself is shared; these messages carry only
/// counters and status.
#[derive(Debug)]
pub enum SeedProgress {
    /// Periodic update with running totals.
    Update {
        dirs_created: u64,
        files_created: u64,
        bytes_written: u64,
        current_path: String,
    },
    /// One entry could not be materialized (budget exhausted, host read
    /// failure, …). The seed continues with the next entry.
    Skipped { path: String, reason: String },
    /// Seeding finished.
    Complete {
        duration: Duration,
        dirs_created: u64,
        files_created: u64,
        bytes_written: u64,
        skipped: u64,
    },
    /// Seeding was cancelled by the caller.
    Cancelled,
}
