use crate::error::Error;

/// Abstract all-reduce seam between the inference core and the physical
/// transport. Every rank calls each method the same number of times and
/// in the same order; a failing rank surfaces through the next call.
pub trait Collective: Sync {
    fn rank(&self) -> usize;
    fn n_ranks(&self) -> usize;
    /// Element-wise sum across ranks, in place on every rank.
    fn all_reduce_sum(&self, local: &mut [f64]);
    fn sum_u64(&self, local: u64) -> u64;
    fn max_f64(&self, local: f64) -> f64;

    fn sum_f64(&self, local: f64) -> f64 {
        let mut buf = [local];
        self.all_reduce_sum(&mut buf);
        buf[0]
    }

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// The degenerate transport: one rank, reductions are identities.
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn n_ranks(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _local: &mut [f64]) {}

    fn sum_u64(&self, local: u64) -> u64 {
        local
    }

    fn max_f64(&self, local: f64) -> f64 {
        local
    }
}

/// Sample counts owned by each rank after RAM-aware partitioning.
#[derive(Clone, Debug, PartialEq)]
pub struct RankPartition {
    pub samples_per_rank: Vec<usize>,
}

impl RankPartition {
    pub fn n_samples(&self) -> usize {
        self.samples_per_rank.iter().sum()
    }

    /// Rank owning valid sample `i` under contiguous assignment.
    pub fn rank_of(&self, i: usize) -> usize {
        let mut acc = 0;
        for (rr, &nn) in self.samples_per_rank.iter().enumerate() {
            acc += nn;
            if i < acc {
                return rr;
            }
        }
        self.samples_per_rank.len() - 1
    }
}

/// Splits `n_samples` valid samples across `n_ranks` ranks.
///
/// The P x L^2 interaction-moment matrix (8 * P * L * (L+1) / 2 bytes in
/// packed lower-triangular form) must fit on a single rank; if it does
/// but crowds out the genotype rows, rank 0 keeps fewer samples and the
/// remainder spreads uniformly over the other ranks. Every rank must end
/// up with at least one sample.
pub fn partition_samples(
    n_samples: usize,
    n_var: usize,
    n_env: usize,
    max_bytes_per_rank: usize,
    n_ranks: usize,
) -> Result<RankPartition, Error> {
    assert!(n_ranks > 0);
    let dxteex_bytes = 8 * n_var * n_env * (n_env + 1) / 2;
    if dxteex_bytes >= max_bytes_per_rank {
        return Err(Error::MemoryBudget(format!(
            "cannot store the {} byte interaction-moment matrix within the \
             {} byte per-rank cap; reduce the number of environmental \
             variables or raise the cap",
            dxteex_bytes, max_bytes_per_rank
        )));
    }

    let mut samples_per_rank = (n_samples + n_ranks - 1) / n_ranks;
    let rank_zero_bytes = dxteex_bytes + n_var * samples_per_rank;
    let rank_zero_samples;
    if rank_zero_bytes > max_bytes_per_rank {
        rank_zero_samples = (max_bytes_per_rank - dxteex_bytes) / n_var;
        if rank_zero_samples == 0 || n_ranks == 1 {
            return Err(Error::MemoryBudget(format!(
                "rank 0 cannot hold both the interaction-moment matrix \
                 ({} bytes) and any genotype rows within the {} byte cap",
                dxteex_bytes, max_bytes_per_rank
            )));
        }
        let remaining = n_samples - rank_zero_samples;
        samples_per_rank = (remaining + n_ranks - 2) / (n_ranks - 1);
    } else {
        rank_zero_samples = samples_per_rank;
    }

    let mut counts = vec![0usize; n_ranks];
    counts[0] = rank_zero_samples.min(n_samples);
    let mut assigned = counts[0];
    for rr in 1..n_ranks {
        let take = samples_per_rank.min(n_samples - assigned);
        counts[rr] = take;
        assigned += take;
    }
    // sweep any rounding remainder onto the last rank
    if assigned < n_samples {
        counts[n_ranks - 1] += n_samples - assigned;
    }

    if counts.iter().any(|&c| c == 0) {
        return Err(Error::MemoryBudget(format!(
            "partitioning {} samples over {} ranks leaves an empty rank",
            n_samples, n_ranks
        )));
    }
    debug_assert_eq!(counts.iter().sum::<usize>(), n_samples);
    Ok(RankPartition { samples_per_rank: counts })
}

/// Human-readable RAM summary across ranks: total, max current and max
/// peak per rank.
pub fn current_usage_ram(collective: &dyn Collective) -> String {
    let kb_local = resident_kb().unwrap_or(0) as f64;
    let peak_local = peak_kb().unwrap_or(0) as f64;
    let kb_global = collective.sum_f64(kb_local);
    let gb_global = kb_global / 1000.0 / 1000.0;
    let gb_max = collective.max_f64(kb_local) / 1000.0 / 1000.0;
    let gb_peak_max = collective.max_f64(peak_local) / 1000.0 / 1000.0;
    format!(
        "RAM usage: {:.2} GB in total; max current={:.2} GB and max peak={:.2} GB per rank",
        gb_global, gb_max, gb_peak_max
    )
}

fn proc_status_kb(key: &str) -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            return digits.parse().ok();
        }
    }
    None
}

fn resident_kb() -> Option<u64> {
    proc_status_kb("VmRSS:")
}

fn peak_kb() -> Option<u64> {
    proc_status_kb("VmPeak:")
}

#[cfg(test)]
mod tests {
    use super::{partition_samples, Collective, SingleProcess};

    #[test]
    fn test_single_process_reductions_are_identity() {
        let coll = SingleProcess;
        assert_eq!(coll.sum_f64(3.5), 3.5);
        assert_eq!(coll.sum_u64(11), 11);
        let mut buf = [1.0, 2.0];
        coll.all_reduce_sum(&mut buf);
        assert_eq!(buf, [1.0, 2.0]);
    }

    #[test]
    fn test_even_partition() {
        let part = partition_samples(100, 1000, 2, usize::MAX / 2, 4).unwrap();
        assert_eq!(part.samples_per_rank, vec![25, 25, 25, 25]);
        assert_eq!(part.n_samples(), 100);
        assert_eq!(part.rank_of(0), 0);
        assert_eq!(part.rank_of(99), 3);
    }

    #[test]
    fn test_rank_zero_shrinks_when_moment_matrix_is_large() {
        // dxteex = 8 * 1000 * 3 = 24000 bytes; cap forces rank 0 smaller
        let n_var = 1000;
        let cap = 24000 + n_var * 10;
        let part = partition_samples(100, n_var, 2, cap, 5).unwrap();
        assert_eq!(part.samples_per_rank[0], 10);
        assert_eq!(part.n_samples(), 100);
        assert!(part.samples_per_rank.iter().all(|&c| c > 0));
    }

    #[test]
    fn test_budget_overflow_is_fatal() {
        assert!(partition_samples(100, 1_000_000, 100, 1_000_000, 4).is_err());
    }
}
