//! Thread-count queries for plan construction.

/// Worker threads available to the current rayon pool.
///
/// Inside `ThreadPool::install` this is the installed pool's size,
/// otherwise the global pool's.
pub fn max_threads() -> usize {
    rayon::current_num_threads().max(1)
}

/// Split `rows` into at most `max_threads()` contiguous blocks.
///
/// Returns the rows per block; the last block may be shorter.
pub fn rows_per_block(rows: usize, threads: usize) -> usize {
    if rows == 0 {
        return 1;
    }
    let threads = threads.clamp(1, rows);
    (rows + threads - 1) / threads
}
