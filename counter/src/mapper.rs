//! Signature-to-bin assignment.
//!
//! Built once after the statistics pass and immutable during partitioning.
//! Signatures are packed into bins so that expected bin sizes stay within
//! about 1.1x of the mean, heavy signatures get bins of their own, and one
//! bin is reserved for the disallowed-signature sentinel.

use kmer::mmer::{is_allowed, MmerNorm};
use std::collections::VecDeque;

pub struct SignatureMapper {
    map: Vec<u32>,
    norm: &'static MmerNorm,
}

const COUNT_BIAS: u64 = 1000;

impl SignatureMapper {
    pub fn new(norm: &'static MmerNorm, n_bins: u32, stats: &[u64]) -> SignatureMapper {
        let map_size = norm.map_size();
        assert_eq!(stats.len(), map_size);
        let mut map = vec![0u32; map_size];

        let mut entries: Vec<(u32, u64)> = (0..norm.sentinel())
            .filter(|&sig| is_allowed(sig, norm.len()))
            .map(|sig| (sig, stats[sig as usize] + COUNT_BIAS))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut entries: VecDeque<(u32, u64)> = entries.into();

        let mut sum: f64 = entries.iter().map(|e| e.1 as f64).sum();
        let max_bins = n_bins - 1; // one reserved for the sentinel
        let mut n = max_bins as usize;
        let mut bin_no = 0u32;
        let mut mean = sum / n_bins as f64;
        let mut max_bin_size = 1.1 * mean;

        while entries.len() > n && n > 0 {
            let heaviest = entries.front().copied().expect("non-empty");
            if heaviest.1 as f64 > mean {
                map[heaviest.0 as usize] = bin_no;
                entries.pop_front();
                sum -= heaviest.1 as f64;
            } else {
                // greedily pack signatures while the bin stays under target
                let mut tmp_sum = 0.0;
                let mut kept = VecDeque::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if tmp_sum + (entry.1 as f64) < max_bin_size {
                        tmp_sum += entry.1 as f64;
                        map[entry.0 as usize] = bin_no;
                    } else {
                        kept.push_back(entry);
                    }
                }
                entries = kept;
                sum -= tmp_sum;
            }
            bin_no += 1;
            n -= 1;
            if bin_no < max_bins {
                mean = sum / (max_bins - bin_no) as f64;
                max_bin_size = 1.1 * mean;
            }
        }
        for (sig, _) in entries {
            map[sig as usize] = bin_no.min(max_bins - 1);
            if bin_no < max_bins {
                bin_no += 1;
            }
        }
        map[norm.sentinel() as usize] = bin_no.min(max_bins);

        SignatureMapper { map, norm }
    }

    #[inline]
    pub fn bin_id(&self, signature: u32) -> u32 {
        self.map[signature as usize]
    }

    /// The sentinel bin for disallowed signatures, also the highest bin id
    /// in use.
    pub fn max_bin_id(&self) -> u32 {
        self.map[self.norm.sentinel() as usize]
    }

    pub fn map_size(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_stats(norm: &MmerNorm, fill: u64) -> Vec<u64> {
        let mut stats = vec![0u64; norm.map_size()];
        for sig in 0..norm.sentinel() {
            if is_allowed(sig, norm.len()) {
                stats[sig as usize] = fill;
            }
        }
        stats
    }

    #[test]
    fn every_allowed_signature_gets_a_bin_test() {
        let norm = MmerNorm::get(5);
        let mapper = SignatureMapper::new(norm, 64, &uniform_stats(norm, 10));
        for sig in 0..norm.sentinel() {
            if is_allowed(sig, 5) {
                assert!(mapper.bin_id(sig) < 64, "sig {} out of range", sig);
                assert_ne!(mapper.bin_id(sig), mapper.max_bin_id());
            }
        }
    }

    #[test]
    fn sentinel_has_own_bin_test() {
        let norm = MmerNorm::get(5);
        let mapper = SignatureMapper::new(norm, 64, &uniform_stats(norm, 1));
        let sentinel_bin = mapper.max_bin_id();
        assert!(sentinel_bin < 64);
        assert_eq!(mapper.bin_id(norm.sentinel()), sentinel_bin);
    }

    #[test]
    fn heavy_signature_isolated_test() {
        let norm = MmerNorm::get(5);
        let mut stats = uniform_stats(norm, 1);
        // find some allowed signature and make it dominate
        let heavy = (0..norm.sentinel()).find(|&s| is_allowed(s, 5)).unwrap();
        stats[heavy as usize] = 1_000_000;
        let mapper = SignatureMapper::new(norm, 64, &stats);
        let heavy_bin = mapper.bin_id(heavy);
        for sig in 0..norm.sentinel() {
            if sig != heavy && is_allowed(sig, 5) {
                assert_ne!(mapper.bin_id(sig), heavy_bin);
            }
        }
    }

    #[test]
    fn bins_reasonably_balanced_test() {
        let norm = MmerNorm::get(7);
        let stats = uniform_stats(norm, 100);
        let n_bins = 128u32;
        let mapper = SignatureMapper::new(norm, n_bins, &stats);
        let mut loads = vec![0u64; n_bins as usize];
        for sig in 0..norm.sentinel() {
            if is_allowed(sig, 7) {
                loads[mapper.bin_id(sig) as usize] += stats[sig as usize] + 1000;
            }
        }
        let used: Vec<u64> = loads.into_iter().filter(|&l| l > 0).collect();
        let mean = used.iter().sum::<u64>() as f64 / used.len() as f64;
        for load in used {
            assert!((load as f64) < 1.6 * mean, "load {} vs mean {}", load, mean);
        }
    }
}
