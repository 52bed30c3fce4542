//! Sample table construction.
//!
//! Every function here is a pure fold over per-sample or per-chunk values;
//! the track model feeds them and wraps the results in boxes.

/// One `stts` run: `count` consecutive samples of `delta` ticks each.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SttsEntry {
    pub count: u32,
    pub delta: u32,
}

/// One `ctts` run of identical composition offsets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CttsEntry {
    pub count: u32,
    pub offset: i32,
}

/// One `stsc` run: chunks from `first_chunk` (1-based) onward hold
/// `samples_per_chunk` samples each, until the next entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

/// Per-sample fields of a `trun` box.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrunSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub composition_offset: i32,
}

/// `trun` sample flags for a sync sample (sample_depends_on = 2).
pub const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;

/// `trun` sample flags for a non-sync sample (depends_on = 1, non_sync = 1).
pub const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

/// How the duration of the final sample is derived.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LastDelta {
    /// Duration 0.
    Unknown,
    /// Same as the delta before it (0 if there is none).
    RepeatPrevious,
    Known(u32),
}

/// Sample-to-chunk compaction: run-length over per-chunk sample counts.
///
/// `[5, 5, 3]` becomes `[(1, 5), (3, 3)]`.
pub fn sample_to_chunk(samples_per_chunk: &[u32]) -> Vec<StscEntry> {
    samples_per_chunk
        .iter()
        .enumerate()
        .fold(Vec::new(), |mut runs: Vec<StscEntry>, (index, &count)| {
            if runs.last().map(|r| r.samples_per_chunk) != Some(count) {
                runs.push(StscEntry {
                    first_chunk: index as u32 + 1,
                    samples_per_chunk: count,
                    sample_description_index: 1,
                });
            }
            runs
        })
}

/// Per-sample durations from decode timestamps (in ticks).
///
/// Non-increasing neighbours produce a delta of 0.
pub fn sample_durations(dts: &[i64], last: LastDelta) -> Vec<u32> {
    let mut durations: Vec<u32> = dts
        .windows(2)
        .map(|w| (w[1] - w[0]).clamp(0, u32::MAX as i64) as u32)
        .collect();
    if !dts.is_empty() {
        let final_delta = match last {
            LastDelta::Unknown => 0,
            LastDelta::RepeatPrevious => durations.last().copied().unwrap_or(0),
            LastDelta::Known(delta) => delta,
        };
        durations.push(final_delta);
    }
    durations
}

/// Time-to-sample table: run-length compacted durations.
pub fn time_to_sample(durations: &[u32]) -> Vec<SttsEntry> {
    let mut runs: Vec<SttsEntry> = Vec::new();
    for &delta in durations {
        match runs.last_mut() {
            Some(run) if run.delta == delta => run.count += 1,
            _ => runs.push(SttsEntry { count: 1, delta }),
        }
    }
    runs
}

/// Composition offsets (`pts - dts`, in ticks), or `None` when every sample
/// presents at its decode time.
pub fn composition_offsets(dts: &[i64], pts: &[i64]) -> Option<Vec<CttsEntry>> {
    if dts.iter().zip(pts).all(|(d, p)| d == p) {
        return None;
    }
    let mut runs: Vec<CttsEntry> = Vec::new();
    for (d, p) in dts.iter().zip(pts) {
        let offset = (p - d).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        match runs.last_mut() {
            Some(run) if run.offset == offset => run.count += 1,
            _ => runs.push(CttsEntry { count: 1, offset }),
        }
    }
    Some(runs)
}

/// 1-based sync sample numbers, or `None` when every sample is a sync sample.
pub fn sync_samples(is_sync: &[bool]) -> Option<Vec<u32>> {
    if is_sync.iter().all(|&s| s) {
        return None;
    }
    Some(
        is_sync
            .iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(i, _)| i as u32 + 1)
            .collect(),
    )
}

/// Sample sizes for `stsz`: `(constant_size, per_sample_sizes)`.
///
/// When every sample has the same size the table collapses to the constant
/// and an empty list.
pub fn sample_sizes(sizes: &[u32]) -> (u32, Vec<u32>) {
    match sizes.first() {
        Some(&first) if sizes.iter().all(|&s| s == first) => (first, Vec::new()),
        _ => (0, sizes.to_vec()),
    }
}

/// Absolute chunk offsets: `first` followed by cumulative chunk sizes.
pub fn chunk_offsets(first: u64, chunk_sizes: &[u64]) -> Vec<u64> {
    chunk_sizes
        .iter()
        .scan(first, |next, &size| {
            let offset = *next;
            *next += size;
            Some(offset)
        })
        .collect()
}

/// Whether the offsets need `co64` instead of `stco`.
pub fn needs_co64(offsets: &[u64]) -> bool {
    offsets.iter().any(|&o| o > u32::MAX as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stsc(first_chunk: u32, samples_per_chunk: u32) -> StscEntry {
        StscEntry {
            first_chunk,
            samples_per_chunk,
            sample_description_index: 1,
        }
    }

    #[test]
    fn test_sample_to_chunk_compacts_runs() {
        assert_eq!(sample_to_chunk(&[5, 5, 3]), vec![stsc(1, 5), stsc(3, 3)]);
        assert_eq!(
            sample_to_chunk(&[2, 3, 3, 2]),
            vec![stsc(1, 2), stsc(2, 3), stsc(4, 2)]
        );
        assert!(sample_to_chunk(&[]).is_empty());
    }

    #[test]
    fn test_durations_last_delta() {
        let dts = [0, 3000, 6000, 9000];
        assert_eq!(
            sample_durations(&dts, LastDelta::Unknown),
            vec![3000, 3000, 3000, 0]
        );
        assert_eq!(
            sample_durations(&dts, LastDelta::RepeatPrevious),
            vec![3000, 3000, 3000, 3000]
        );
        assert_eq!(
            sample_durations(&dts, LastDelta::Known(1500)),
            vec![3000, 3000, 3000, 1500]
        );
        assert_eq!(sample_durations(&[0], LastDelta::RepeatPrevious), vec![0]);
        assert!(sample_durations(&[], LastDelta::Known(1)).is_empty());
    }

    #[test]
    fn test_time_to_sample_unknown_last_appends_zero_run() {
        let durations = sample_durations(&[0, 1024, 2048], LastDelta::Unknown);
        assert_eq!(
            time_to_sample(&durations),
            vec![
                SttsEntry {
                    count: 2,
                    delta: 1024
                },
                SttsEntry { count: 1, delta: 0 },
            ]
        );
    }

    #[test]
    fn test_time_to_sample_varied() {
        let durations = [3000, 3000, 3003, 3000];
        assert_eq!(
            time_to_sample(&durations),
            vec![
                SttsEntry {
                    count: 2,
                    delta: 3000
                },
                SttsEntry {
                    count: 1,
                    delta: 3003
                },
                SttsEntry {
                    count: 1,
                    delta: 3000
                },
            ]
        );
    }

    #[test]
    fn test_composition_offsets() {
        assert_eq!(composition_offsets(&[0, 10], &[0, 10]), None);
        let runs = composition_offsets(&[0, 10, 20, 30], &[20, 10, 40, 50]).unwrap();
        assert_eq!(
            runs,
            vec![
                CttsEntry {
                    count: 1,
                    offset: 20
                },
                CttsEntry {
                    count: 1,
                    offset: 0
                },
                CttsEntry {
                    count: 2,
                    offset: 20
                },
            ]
        );
    }

    #[test]
    fn test_composition_offsets_can_be_negative() {
        let runs = composition_offsets(&[10], &[0]).unwrap();
        assert_eq!(runs[0].offset, -10);
    }

    #[test]
    fn test_sync_samples() {
        assert_eq!(sync_samples(&[true, true]), None);
        assert_eq!(
            sync_samples(&[true, false, false, true, false]),
            Some(vec![1, 4])
        );
    }

    #[test]
    fn test_sample_sizes_collapse() {
        assert_eq!(sample_sizes(&[100, 100, 100]), (100, vec![]));
        assert_eq!(sample_sizes(&[100, 200]), (0, vec![100, 200]));
        assert_eq!(sample_sizes(&[]), (0, vec![]));
    }

    #[test]
    fn test_chunk_offsets_and_co64() {
        let offsets = chunk_offsets(48, &[100, 20, 5]);
        assert_eq!(offsets, vec![48, 148, 168]);
        assert!(!needs_co64(&offsets));
        assert!(needs_co64(&chunk_offsets(u32::MAX as u64, &[10, 10])));
    }

    proptest! {
        #[test]
        fn stsc_expands_back_to_chunk_counts(counts in prop::collection::vec(1u32..8, 0..40)) {
            let runs = sample_to_chunk(&counts);
            let mut expanded = Vec::new();
            for (i, run) in runs.iter().enumerate() {
                let end = runs
                    .get(i + 1)
                    .map_or(counts.len() as u32 + 1, |next| next.first_chunk);
                for _ in run.first_chunk..end {
                    expanded.push(run.samples_per_chunk);
                }
            }
            prop_assert_eq!(expanded, counts);
        }

        #[test]
        fn stts_preserves_sample_count(deltas in prop::collection::vec(0i64..5000, 1..60)) {
            let dts: Vec<i64> = deltas
                .iter()
                .scan(0i64, |t, d| {
                    *t += d;
                    Some(*t)
                })
                .collect();
            let durations = sample_durations(&dts, LastDelta::RepeatPrevious);
            let runs = time_to_sample(&durations);
            prop_assert_eq!(runs.iter().map(|r| r.count as usize).sum::<usize>(), dts.len());
        }
    }
}
