/// Maps a destination index to the partition it executes
pub trait AssignStrategy: Send + Sync {
    /// `None` means the destination executes nothing
    fn assign(&self, index: usize, partition_count: usize) -> Option<usize>;
}

/// Destination `i` executes partition `i`; indices past the end execute nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl AssignStrategy for RoundRobin {
    fn assign(&self, index: usize, partition_count: usize) -> Option<usize> {
        if partition_count == 0 || index >= partition_count {
            return None;
        }
        Some(index % partition_count)
    }
}

/// Wraps around: destination `i` executes partition `i mod count`
#[derive(Debug, Clone, Copy, Default)]
pub struct Wrapping;

impl AssignStrategy for Wrapping {
    fn assign(&self, index: usize, partition_count: usize) -> Option<usize> {
        (partition_count > 0).then(|| index % partition_count)
    }
}

impl<F> AssignStrategy for F
where
    F: Fn(usize, usize) -> Option<usize> + Send + Sync,
{
    fn assign(&self, index: usize, partition_count: usize) -> Option<usize> {
        self(index, partition_count)
    }
}
