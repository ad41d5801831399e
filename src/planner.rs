// ABOUTME: Chunk Planner - splits a table row count into page offsets
// ABOUTME: Pure function over a count snapshot taken before any chunk runs

/// Offsets `0, chunk_size, 2 * chunk_size, ...` strictly below `row_count`.
///
/// Yields `ceil(row_count / chunk_size)` offsets. A zero chunk size plans
/// nothing.
pub fn plan(row_count: u64, chunk_size: u64) -> Vec<u64> {
    if chunk_size == 0 {
        return Vec::new();
    }
    (0..row_count).step_by(chunk_size as usize).collect()
}
