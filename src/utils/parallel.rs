use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::warn;

use crate::config::ComputeMode;

/// Evaluate `f` for every index in `0..n`, in order, serially or on a
/// dedicated rayon pool. Output order is the same in both modes.
pub(crate) fn map_indexed<T, F>(mode: &ComputeMode, n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    match mode {
        ComputeMode::Serial => (0..n).map(f).collect(),
        ComputeMode::Parallel { threads } => {
            let threads = threads.unwrap_or_else(num_cpus::get).max(1);
            match ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => pool.install(|| (0..n).into_par_iter().map(&f).collect()),
                Err(err) => {
                    warn!(%err, "could not start thread pool, running serially");
                    (0..n).map(f).collect()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_agree() {
        let serial = map_indexed(&ComputeMode::Serial, 100, |i| (i as f64).sqrt());
        let parallel = map_indexed(&ComputeMode::Parallel { threads: Some(4) }, 100, |i| {
            (i as f64).sqrt()
        });
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_empty_range() {
        let out: Vec<usize> = map_indexed(&ComputeMode::Parallel { threads: None }, 0, |i| i);
        assert!(out.is_empty());
    }
}
