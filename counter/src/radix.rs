//! Parallel MSD radix sort over fixed-width k-mer records.
//!
//! One pass per record byte, most significant first. The scatter runs
//! through per-bucket software write-combining buffers so records destined
//! for one bucket leave the core in contiguous bursts; buffer widths follow
//! the record size. At the top level the input is cut into `threads * 8`
//! sub-ranges with private histograms; after the scatter, buckets above
//! `2n / (3 * threads)` keep the full thread fan-out while the rest drain
//! from a size-ordered task queue. Small ranges fall through to a
//! comparison sort.
//!
//! The SIMD-specialized scatter variants of the original design collapse to
//! one portable loop selected per process by a CPU capability probe; the
//! probe still picks the write-combining width (and disables combining when
//! no vector unit is found) so the memory-access pattern survives.

use crate::shared::SharedSlice;
use kmer::words::KmerWords;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuLevel {
    Avx2,
    Sse2,
    Neon,
    Portable,
}

pub fn detect_cpu() -> CpuLevel {
    static LEVEL: OnceLock<CpuLevel> = OnceLock::new();
    *LEVEL.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx2") {
                CpuLevel::Avx2
            } else if std::arch::is_x86_feature_detected!("sse2") {
                CpuLevel::Sse2
            } else {
                CpuLevel::Portable
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            CpuLevel::Neon
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            CpuLevel::Portable
        }
    })
}

/// Write-combining widths by record size in words, designated experimentally
/// in the original radix implementation.
const BUFFER_WIDTHS: [usize; 10] = [1, 32, 16, 16, 8, 8, 4, 8, 4, 4];

const SMALL_SORT_THRESHOLD: usize = 384;
const SMALL_SORT_THRESHOLD_NARROW: usize = 32;
const SUB_RANGES_PER_THREAD: usize = 8;

#[derive(Clone, Copy)]
struct SortConfig {
    buffer_width: usize,
    small_sort_threshold: usize,
}

fn sort_config<const W: usize>() -> SortConfig {
    match detect_cpu() {
        CpuLevel::Portable => SortConfig {
            buffer_width: 1,
            small_sort_threshold: SMALL_SORT_THRESHOLD_NARROW,
        },
        _ => SortConfig {
            buffer_width: BUFFER_WIDTHS[W.min(9)],
            small_sort_threshold: SMALL_SORT_THRESHOLD,
        },
    }
}

/// Sort `input` on its low `rec_bytes` bytes. The sorted records land in
/// `input` when `rec_bytes` is even and in `tmp` when odd, matching the
/// pass-parity layout the arena planned for.
pub fn radix_sort_msd<const W: usize>(
    input: &mut [KmerWords<W>],
    tmp: &mut [KmerWords<W>],
    rec_bytes: usize,
    n_threads: usize,
) {
    debug_assert!(rec_bytes >= 1 && rec_bytes <= W * 8);
    debug_assert!(input.len() <= tmp.len());
    let n = input.len();
    if n == 0 {
        return;
    }
    let cfg = sort_config::<W>();
    let tmp = &mut tmp[..n];
    if n_threads <= 1 || n < 2 * cfg.small_sort_threshold * n_threads {
        let mut scratch = vec![KmerWords::<W>::zero(); 256 * cfg.buffer_width];
        sort_seq(input, tmp, rec_bytes - 1, &cfg, &mut scratch);
    } else {
        sort_par(input, tmp, rec_bytes - 1, n_threads, &cfg);
    }
}

fn small_sort<const W: usize>(
    src: &mut [KmerWords<W>],
    dst: &mut [KmerWords<W>],
    byte_idx: usize,
) {
    src.sort_unstable();
    // keep the pass-parity contract on where sorted data rests
    if (byte_idx + 1) % 2 == 1 {
        dst.copy_from_slice(src);
    }
}

fn sort_seq<const W: usize>(
    src: &mut [KmerWords<W>],
    dst: &mut [KmerWords<W>],
    byte_idx: usize,
    cfg: &SortConfig,
    scratch: &mut [KmerWords<W>],
) {
    let n = src.len();
    if n < cfg.small_sort_threshold.max(2) {
        small_sort(src, dst, byte_idx);
        return;
    }

    let mut hist = [0usize; 256];
    for rec in src.iter() {
        hist[rec.get_byte(byte_idx) as usize] += 1;
    }

    let mut offsets = [0usize; 256];
    let mut acc = 0usize;
    for b in 0..256 {
        offsets[b] = acc;
        acc += hist[b];
    }

    scatter_wc(src, SharedSlice::new(dst), &mut offsets, byte_idx, cfg, scratch);

    if byte_idx == 0 {
        return;
    }
    let mut start = 0usize;
    for b in 0..256 {
        let cnt = hist[b];
        if cnt > 1 {
            sort_seq(
                &mut dst[start..start + cnt],
                &mut src[start..start + cnt],
                byte_idx - 1,
                cfg,
                scratch,
            );
        } else if cnt == 1 && byte_idx % 2 == 1 {
            // singleton still has to end up in the final buffer
            src[start] = dst[start];
        }
        start += cnt;
    }
}

/// Scatter through per-bucket software buffers; each full buffer leaves as
/// one contiguous burst.
fn scatter_wc<const W: usize>(
    src: &[KmerWords<W>],
    dst: SharedSlice<'_, KmerWords<W>>,
    offsets: &mut [usize; 256],
    byte_idx: usize,
    cfg: &SortConfig,
    scratch: &mut [KmerWords<W>],
) {
    let width = cfg.buffer_width;
    if width <= 1 {
        for rec in src.iter() {
            let b = rec.get_byte(byte_idx) as usize;
            unsafe { dst.set(offsets[b], *rec) };
            offsets[b] += 1;
        }
        return;
    }
    let mut fill = [0usize; 256];
    for rec in src.iter() {
        let b = rec.get_byte(byte_idx) as usize;
        scratch[b * width + fill[b]] = *rec;
        fill[b] += 1;
        if fill[b] == width {
            unsafe { dst.copy_in(offsets[b], &scratch[b * width..(b + 1) * width]) };
            offsets[b] += width;
            fill[b] = 0;
        }
    }
    // drain the partially filled buffers
    for b in 0..256 {
        if fill[b] > 0 {
            unsafe { dst.copy_in(offsets[b], &scratch[b * width..b * width + fill[b]]) };
            offsets[b] += fill[b];
            fill[b] = 0;
        }
    }
}

fn sort_par<const W: usize>(
    src: &mut [KmerWords<W>],
    dst: &mut [KmerWords<W>],
    byte_idx: usize,
    n_threads: usize,
    cfg: &SortConfig,
) {
    let n = src.len();
    if n_threads <= 1 || n < 2 * cfg.small_sort_threshold * n_threads {
        let mut scratch = vec![KmerWords::<W>::zero(); 256 * cfg.buffer_width];
        sort_seq(src, dst, byte_idx, cfg, &mut scratch);
        return;
    }

    let n_sub = n_threads * SUB_RANGES_PER_THREAD;
    let sub_size = n / n_sub;
    let bounds: Vec<(usize, usize)> = (0..n_sub)
        .map(|s| {
            let start = s * sub_size;
            let end = if s == n_sub - 1 { n } else { (s + 1) * sub_size };
            (start, end)
        })
        .collect();

    // count pass: private histogram per sub-range
    let src_shared = SharedSlice::new(src);
    let hists_mtx: Mutex<Vec<[usize; 256]>> = Mutex::new(vec![[0usize; 256]; n_sub]);
    {
        let next = AtomicUsize::new(0);
        rayon::scope(|scope| {
            for _ in 0..n_threads {
                scope.spawn(|_| loop {
                    let s = next.fetch_add(1, Ordering::Relaxed);
                    if s >= n_sub {
                        break;
                    }
                    let (start, end) = bounds[s];
                    let range = unsafe { src_shared.slice_mut(start, end) };
                    let mut hist = [0usize; 256];
                    for rec in range.iter() {
                        hist[rec.get_byte(byte_idx) as usize] += 1;
                    }
                    hists_mtx.lock().unwrap()[s] = hist;
                });
            }
        });
    }
    let hists = hists_mtx.into_inner().unwrap();

    // column-wise prefix sums give each sub-range its bucket offsets
    let mut offsets = vec![[0usize; 256]; n_sub];
    let mut bucket_sizes = [0usize; 256];
    let mut acc = 0usize;
    for b in 0..256 {
        for s in 0..n_sub {
            offsets[s][b] = acc;
            acc += hists[s][b];
            bucket_sizes[b] += hists[s][b];
        }
    }

    // scatter pass; each sub-range owns a private copy of its offsets
    let dst_shared = SharedSlice::new(dst);
    {
        let next = AtomicUsize::new(0);
        let offsets = &offsets;
        rayon::scope(|scope| {
            for _ in 0..n_threads {
                scope.spawn(|_| {
                    let mut scratch = vec![KmerWords::<W>::zero(); 256 * cfg.buffer_width];
                    loop {
                        let s = next.fetch_add(1, Ordering::Relaxed);
                        if s >= n_sub {
                            break;
                        }
                        let (start, end) = bounds[s];
                        let range = unsafe { src_shared.slice_mut(start, end) };
                        let mut offs = offsets[s];
                        scatter_wc(range, dst_shared, &mut offs, byte_idx, cfg, &mut scratch);
                    }
                });
            }
        });
    }

    if byte_idx == 0 {
        return;
    }

    // big buckets keep the full fan-out; the rest drain from a task queue
    let big_threshold = 2 * n / (3 * n_threads);
    let mut bucket_starts = [0usize; 256];
    let mut start = 0usize;
    let mut queue: Vec<(usize, usize)> = Vec::new(); // (size, bucket)
    let mut big: Vec<usize> = Vec::new();
    for b in 0..256 {
        bucket_starts[b] = start;
        if bucket_sizes[b] > big_threshold {
            big.push(b);
        } else if bucket_sizes[b] > 0 {
            queue.push((bucket_sizes[b], b));
        }
        start += bucket_sizes[b];
    }

    for &b in &big {
        let s = bucket_starts[b];
        let e = s + bucket_sizes[b];
        let bucket_dst = unsafe { dst_shared.slice_mut(s, e) };
        let bucket_src = unsafe { src_shared.slice_mut(s, e) };
        sort_par(bucket_dst, bucket_src, byte_idx - 1, n_threads, cfg);
    }

    queue.sort_unstable_by(|a, b| b.cmp(a));
    let next = AtomicUsize::new(0);
    rayon::scope(|scope| {
        for _ in 0..n_threads {
            scope.spawn(|_| {
                let mut scratch = vec![KmerWords::<W>::zero(); 256 * cfg.buffer_width];
                loop {
                    let t = next.fetch_add(1, Ordering::Relaxed);
                    if t >= queue.len() {
                        break;
                    }
                    let (size, b) = queue[t];
                    let s = bucket_starts[b];
                    let bucket_dst = unsafe { dst_shared.slice_mut(s, s + size) };
                    let bucket_src = unsafe { src_shared.slice_mut(s, s + size) };
                    if size == 1 {
                        if byte_idx % 2 == 1 {
                            bucket_src[0] = bucket_dst[0];
                        }
                        continue;
                    }
                    sort_seq(bucket_dst, bucket_src, byte_idx - 1, cfg, &mut scratch);
                }
            });
        }
    });
}
