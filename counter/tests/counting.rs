//! End-to-end counting scenarios over real files in a temp directory.

use counter::params::Params;
use counter::DbReader;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("diskmer_e2e").join(name);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_file(dir: &PathBuf, name: &str, content: &[u8]) -> String {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path.display().to_string()
}

fn base_params(dir: &PathBuf, inputs: Vec<String>, k: usize) -> Params {
    Params {
        input_paths: inputs,
        output_base: dir.join("db"),
        working_dir: dir.clone(),
        kmer_len: k,
        signature_len: 5,
        max_mem_gb: 1,
        cutoff_min: 1,
        cutoff_max: 1_000_000_000,
        counter_max: 255,
        both_strands: false,
        file_format: ktio::seq::SeqFormat::Fasta,
        n_bins: 64,
        n_threads: 2,
        ..Params::default()
    }
}

fn counted(params: &Params) -> Vec<(String, u64)> {
    counter::count(params).unwrap();
    let mut records = DbReader::open(&params.output_base).unwrap().records().unwrap();
    records.sort();
    records
}

/// Direct canonical/forward counting oracle over plain sequences.
fn oracle(seqs: &[&str], k: usize, canonical: bool) -> Vec<(String, u64)> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for seq in seqs {
        let bytes = seq.as_bytes();
        'next: for w in bytes.windows(k) {
            for &b in w {
                if !matches!(b, b'A' | b'C' | b'G' | b'T') {
                    continue 'next;
                }
            }
            let fwd = String::from_utf8(w.to_vec()).unwrap();
            let key = if canonical {
                let rc: String = w
                    .iter()
                    .rev()
                    .map(|&b| match b {
                        b'A' => 'T',
                        b'C' => 'G',
                        b'G' => 'C',
                        _ => 'A',
                    })
                    .collect();
                fwd.min(rc)
            } else {
                fwd
            };
            *counts.entry(key).or_default() += 1;
        }
    }
    let mut out: Vec<(String, u64)> = counts.into_iter().collect();
    out.sort();
    out
}

#[test]
fn e1_forward_counts_test() {
    let dir = test_dir("e1");
    let input = write_file(&dir, "r.fa", b">r\nACGTACGTAC\n");
    let params = base_params(&dir, vec![input], 3);
    assert_eq!(
        counted(&params),
        vec![
            ("ACG".to_string(), 2),
            ("CGT".to_string(), 2),
            ("GTA".to_string(), 2),
            ("TAC".to_string(), 2)
        ]
    );
}

#[test]
fn e2_canonical_counts_test() {
    let dir = test_dir("e2");
    let input = write_file(&dir, "r.fa", b">r\nACGTACGTAC\n");
    let mut params = base_params(&dir, vec![input], 3);
    params.both_strands = true;
    assert_eq!(
        counted(&params),
        vec![("ACG".to_string(), 4), ("GTA".to_string(), 4)]
    );
}

#[test]
fn e3_n_blocks_kmers_test() {
    let dir = test_dir("e3");
    let input = write_file(&dir, "r.fq", b"@r\nACNGTAC\n+\n!!!!!!!\n");
    let mut params = base_params(&dir, vec![input], 3);
    params.file_format = ktio::seq::SeqFormat::Fastq;
    assert_eq!(
        counted(&params),
        vec![("GTA".to_string(), 1), ("TAC".to_string(), 1)]
    );
}

#[test]
fn e4_counts_accumulate_across_records_test() {
    let dir = test_dir("e4");
    let input = write_file(&dir, "r.fa", b">a\nAAAAA\n>b\nAAAAA\n");
    let mut params = base_params(&dir, vec![input], 3);
    params.cutoff_min = 2;
    assert_eq!(counted(&params), vec![("AAA".to_string(), 6)]);
}

#[test]
fn e5_cutoff_window_test() {
    let dir = test_dir("e5");
    let input = write_file(&dir, "r.fa", b">r\nACGTACGTACGT\n");
    let mut params = base_params(&dir, vec![input], 3);
    params.cutoff_min = 3;
    params.cutoff_max = 5;
    params.counter_max = 4;
    assert_eq!(
        counted(&params),
        vec![
            ("ACG".to_string(), 3),
            ("CGT".to_string(), 3),
            ("GTA".to_string(), 3),
            ("TAC".to_string(), 3)
        ]
    );
}

#[test]
fn e6_long_repeat_saturates_test() {
    let dir = test_dir("e6");
    let seq: String = "ACGT".repeat(250_000);
    let mut content = b">r\n".to_vec();
    content.extend_from_slice(seq.as_bytes());
    content.push(b'\n');
    let input = write_file(&dir, "r.fa", &content);
    let mut params = base_params(&dir, vec![input], 21);
    params.cutoff_min = 2;
    let summary = counter::count(&params).unwrap();
    assert_eq!(summary.n_total_kmers, 1_000_000 - 20);
    let mut records = DbReader::open(&params.output_base).unwrap().records().unwrap();
    records.sort();
    assert_eq!(records.len(), 4);
    for (kmer, count) in &records {
        assert_eq!(kmer.len(), 21);
        assert_eq!(*count, 255, "kmer {} not saturated", kmer);
    }
}

#[test]
fn general_path_matches_oracle_forward_test() {
    let dir = test_dir("gen_fwd");
    let seqs = [
        "ATCGGCTAAGCTTAGGCTAGCTAGGCATCGGATCAGTTTCAGGATC",
        "TTTTTTTTTTTTTTTTTTTTTTTT",
        "ACGTNACGTACGTACGTACGTACGTAAACCCGGGTTT",
    ];
    let mut content = Vec::new();
    for (i, s) in seqs.iter().enumerate() {
        writeln!(content, ">r{}\n{}", i, s).unwrap();
    }
    let input = write_file(&dir, "r.fa", &content);
    let params = base_params(&dir, vec![input], 15);
    assert_eq!(counted(&params), oracle(&seqs, 15, false));
}

#[test]
fn general_path_matches_oracle_canonical_test() {
    let dir = test_dir("gen_canon");
    let seqs = [
        "ATCGGCTAAGCTTAGGCTAGCTAGGCATCGGATCAGTTTCAGGATC",
        "GGCATGCAAGTCCAATCGGGCATAAGCATTAGCAGCTAGCTA",
        "ACGTACGTACGTACGTACGTACGTACGT",
    ];
    let mut content = Vec::new();
    for (i, s) in seqs.iter().enumerate() {
        writeln!(content, ">r{}\n{}", i, s).unwrap();
    }
    let input = write_file(&dir, "r.fa", &content);
    let mut params = base_params(&dir, vec![input], 15);
    params.both_strands = true;
    assert_eq!(counted(&params), oracle(&seqs, 15, true));
}

#[test]
fn sequences_shorter_than_k_are_ignored_test() {
    let dir = test_dir("short");
    let input = write_file(&dir, "r.fa", b">a\nACGT\n>b\nACGTACGTACGTACGTACG\n");
    let params = base_params(&dir, vec![input], 15);
    let summary = counter::count(&params).unwrap();
    assert_eq!(summary.n_total_kmers, 5);
}

#[test]
fn gzip_input_test() {
    let dir = test_dir("gzip");
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(b">r\nACGTACGTACGTACGTACGTACG\n").unwrap();
    let gz = enc.finish().unwrap();
    let input = write_file(&dir, "r.fa.gz", &gz);
    let params = base_params(&dir, vec![input], 15);
    assert_eq!(counted(&params), oracle(&["ACGTACGTACGTACGTACGTACG"], 15, false));
}

#[test]
fn multiline_fasta_spans_lines_test() {
    let dir = test_dir("multiline");
    // one logical sequence wrapped over lines; k-mers cross the breaks
    let input = write_file(&dir, "g.fa", b">chr\nACGTACGTAC\nGTACGTACGT\nACGTACG\n");
    let mut params = base_params(&dir, vec![input], 15);
    params.file_format = ktio::seq::SeqFormat::MultiFasta;
    let merged = "ACGTACGTACGTACGTACGTACGTACG";
    assert_eq!(counted(&params), oracle(&[merged], 15, false));
}

#[test]
fn permutation_of_inputs_is_deterministic_test() {
    let dir_a = test_dir("perm_a");
    let dir_b = test_dir("perm_b");
    let fa1 = b">x\nATCGGCTAAGCTTAGGCTAGCTAGGCATCGG\n";
    let fa2 = b">y\nGGCATGCAAGTCCAATCGGGCATAAGCATTA\n";

    let in_a1 = write_file(&dir_a, "a.fa", fa1);
    let in_a2 = write_file(&dir_a, "b.fa", fa2);
    let mut params_a = base_params(&dir_a, vec![in_a1, in_a2], 15);
    params_a.n_threads = 1;
    counter::count(&params_a).unwrap();

    let in_b1 = write_file(&dir_b, "a.fa", fa1);
    let in_b2 = write_file(&dir_b, "b.fa", fa2);
    let mut params_b = base_params(&dir_b, vec![in_b2, in_b1], 15);
    params_b.n_threads = 1;
    counter::count(&params_b).unwrap();

    let (pre_a, suf_a) = counter::output::db_paths(&params_a.output_base);
    let (pre_b, suf_b) = counter::output::db_paths(&params_b.output_base);
    assert_eq!(fs::read(pre_a).unwrap(), fs::read(pre_b).unwrap());
    assert_eq!(fs::read(suf_a).unwrap(), fs::read(suf_b).unwrap());
}

#[test]
fn rerun_on_dump_is_idempotent_test() {
    let dir = test_dir("idem");
    let input = write_file(&dir, "r.fa", b">r\nATCGGCTAAGCTTAGGCTAGCTAGGCATCGGA\n");
    let params = base_params(&dir, vec![input], 15);
    let first = counted(&params);

    // feed every counted k-mer back in as a single-k-mer read
    let mut content = Vec::new();
    for (i, (kmer, _)) in first.iter().enumerate() {
        writeln!(content, ">k{}\n{}", i, kmer).unwrap();
    }
    let dir2 = test_dir("idem2");
    let input2 = write_file(&dir2, "kmers.fa", &content);
    let params2 = base_params(&dir2, vec![input2], 15);
    let second = counted(&params2);
    assert_eq!(second.len(), first.len());
    assert!(second.iter().all(|(_, c)| *c == 1));
    let keys1: Vec<&String> = first.iter().map(|(k, _)| k).collect();
    let keys2: Vec<&String> = second.iter().map(|(k, _)| k).collect();
    assert_eq!(keys1, keys2);
}

#[test]
fn counts_summary_accounting_test() {
    let dir = test_dir("accounting");
    let input = write_file(&dir, "r.fa", b">r\nACGTACGTACGTACGTACGTACGTACG\n");
    let mut params = base_params(&dir, vec![input], 15);
    params.cutoff_min = 3;
    let summary = counter::count(&params).unwrap();
    // every k-mer instance is accounted: surviving + cutoff sides
    assert_eq!(summary.n_total_kmers, (27 - 15 + 1) as u64);
    let reader = DbReader::open(&params.output_base).unwrap();
    let stored: u64 = reader.records().unwrap().iter().map(|(_, c)| *c).sum();
    assert!(stored <= summary.n_total_kmers);
    assert_eq!(
        reader.header.counted,
        summary.n_unique - summary.n_below_min - summary.n_above_max
    );
}

#[test]
fn kff_output_written_test() {
    let dir = test_dir("kff");
    let input = write_file(&dir, "r.fa", b">r\nACGTACGTACGTACGTACGT\n");
    let mut params = base_params(&dir, vec![input], 15);
    params.kff_output = true;
    counter::count(&params).unwrap();
    let kff = fs::read(params.output_base.with_extension("kff")).unwrap();
    assert_eq!(&kff[..3], b"KFF");
    assert_eq!(&kff[kff.len() - 3..], b"KFF");
}

#[test]
fn json_summary_written_test() {
    let dir = test_dir("json");
    let input = write_file(&dir, "r.fa", b">r\nACGTACGTAC\n");
    let mut params = base_params(&dir, vec![input], 3);
    params.json_summary = Some(dir.join("summary.json"));
    counter::count(&params).unwrap();
    let text = fs::read_to_string(dir.join("summary.json")).unwrap();
    assert!(text.contains("\"n_unique\": 4"));
}

#[test]
fn missing_input_fails_test() {
    let dir = test_dir("missing");
    let params = base_params(&dir, vec![dir.join("nope.fa").display().to_string()], 15);
    assert!(counter::count(&params).is_err());
}

#[test]
fn ram_only_bins_test() {
    let dir = test_dir("ram_only");
    let seqs = ["ATCGGCTAAGCTTAGGCTAGCTAGGCATCGGATCAGTT"];
    let input = write_file(&dir, "r.fa", format!(">r\n{}\n", seqs[0]).as_bytes());
    let mut params = base_params(&dir, vec![input], 15);
    params.mem_mode = true;
    assert_eq!(counted(&params), oracle(&seqs, 15, false));
}
