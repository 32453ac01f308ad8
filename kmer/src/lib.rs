pub mod mmer;
pub mod words;

use words::KmerWords;

pub type Kmer = u64;

/// Code used for any symbol outside ACGT.
pub const CODE_N: u8 = 4;

// https://github.com/lh3/minimap2/blob/0cc3cdca27f050fb80a19c90d25ecc6ab0b0907b/sketch.c#L9C1-L26C3
pub const SEQ_NT4_TABLE: [u8; 256] = [
    0, 1, 2, 3, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 0, 4, 1, 4, 4, 4, 2, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 0, 4, 1, 4, 4, 4, 2, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
];

const BASES: [char; 4] = ['A', 'C', 'G', 'T'];

/// Render a packed value as its `k` bases, most significant base first.
pub fn numeric_to_kmer(kmer: u64, k: usize) -> String {
    (0..k)
        .rev()
        .map(|i| BASES[((kmer >> (2 * i)) & 3) as usize])
        .collect()
}

/// Pack a base string into its forward and reverse-complement values,
/// through the same word ops the pipeline's records use.
pub fn kmer_to_numeric(kmer: &str) -> (u64, u64) {
    let mut fwd = KmerWords::<1>::zero();
    let mut rev = KmerWords::<1>::zero();
    let rev_shift = 2 * (kmer.len() as u32 - 1);
    for b in kmer.bytes() {
        let code = SEQ_NT4_TABLE[b as usize] as u64;
        fwd.shl_insert_2bits(code);
        rev.shr_insert_2bits(3 - code, rev_shift);
    }
    (fwd.data[0], rev.data[0])
}
