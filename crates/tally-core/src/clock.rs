use chrono::Utc;

/// Produce the version stamp for a new edit to an item.
///
/// Returns `max(now, prev + 1)` so that two edits to the same item within the
/// same clock second still get strictly increasing versions and cannot be
/// collapsed or misordered by the reconciler.
pub fn next_version(prev: i64) -> i64 {
    next_version_at(Utc::now().timestamp(), prev)
}

fn next_version_at(now: i64, prev: i64) -> i64 {
    now.max(prev + 1)
}
