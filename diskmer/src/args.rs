use clap::{Args, Parser, Subcommand, ValueEnum};
use counter::params::Params;
use ktio::seq::SeqFormat;
use std::path::PathBuf;

const ABOUT: &str = "diskmer: disk-based k-mer counting

counts k-mers of FASTA/FASTQ/BAM inputs through a
minimizer-partitioned external-memory pipeline";

/// diskmer: disk-based k-mer counting
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = ABOUT)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Input record layouts
#[derive(Debug, ValueEnum, Clone, Copy)]
pub enum InputFormat {
    /// FASTA reads
    Fa,
    /// FASTQ reads
    Fq,
    /// Multiline FASTA (genomes)
    Fm,
    /// BAM alignments
    Bam,
}

impl InputFormat {
    pub fn to_seq_format(self) -> SeqFormat {
        match self {
            InputFormat::Fa => SeqFormat::Fasta,
            InputFormat::Fq => SeqFormat::Fastq,
            InputFormat::Fm => SeqFormat::MultiFasta,
            InputFormat::Bam => SeqFormat::Bam,
        }
    }
}

/// Subcommands available
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Count k-mers into a database
    Count(CountCommand),
    /// Dump a counted database as k-mer / count lines
    Dump(DumpCommand),
}

#[derive(Debug, Args)]
pub struct CountCommand {
    /// Input file paths; an argument of the form @list names a file with
    /// one input path per line
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Output database basename
    #[arg(short, long)]
    pub output: String,

    /// Directory for temporary bin files
    #[arg(short = 'w', long, default_value = ".")]
    pub tmp_dir: String,

    /// k-mer length
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..=256), default_value_t = 25)]
    pub k_size: u64,

    /// Max memory in GB
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..=1024), default_value_t = 12)]
    pub memory: u64,

    /// Signature (minimiser) length
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u64).range(5..=11), default_value_t = 9)]
    pub sig_len: u64,

    /// Input format
    #[clap(value_enum, short, long, default_value_t = InputFormat::Fq)]
    pub format: InputFormat,

    /// Exclude k-mers occurring fewer than this many times
    #[arg(long = "ci", default_value_t = 2)]
    pub cutoff_min: u32,

    /// Exclude k-mers occurring more than this many times
    #[arg(long = "cx", default_value_t = 1_000_000_000)]
    pub cutoff_max: u64,

    /// Saturate counters at this value
    #[arg(long = "cs", default_value_t = 255)]
    pub counter_max: u64,

    /// Count all k-mers instead of canonical representations
    #[arg(short = 'b', long)]
    pub no_canonical: bool,

    /// Strict memory mode: never grow past the budget, reprocess oversized
    /// bins through the sub-bin pipeline
    #[arg(long = "sm")]
    pub strict_memory: bool,

    /// Keep temporary bins in RAM instead of the working directory
    #[arg(short = 'r', long)]
    pub ram_only: bool,

    /// Number of bins
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(64..=2000), default_value_t = 512)]
    pub bins: u64,

    /// Thread count for computations 0=auto
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Reading threads 0=auto
    #[arg(long = "sf", default_value_t = 0)]
    pub n_readers: usize,

    /// Splitting threads 0=auto
    #[arg(long = "sp", default_value_t = 0)]
    pub n_splitters: usize,

    /// Sorting-stage threads 0=auto
    #[arg(long = "sr", default_value_t = 0)]
    pub n_sorters: usize,

    /// Strict-memory sorting threads 0=auto
    #[arg(long = "smso", default_value_t = 0)]
    pub sm_sorters: usize,

    /// Strict-memory uncompactor threads 0=auto
    #[arg(long = "smun", default_value_t = 0)]
    pub sm_uncompactors: usize,

    /// Strict-memory merger threads 0=auto
    #[arg(long = "smme", default_value_t = 0)]
    pub sm_mergers: usize,

    /// Also write the counted set in KFF format
    #[arg(long)]
    pub kff: bool,

    /// Write final statistics as JSON
    #[arg(long)]
    pub json_summary: Option<String>,

    /// Keep temporary bin files after counting
    #[arg(long, hide = true)]
    pub keep_intermediates: bool,

    /// Print stage banners and progress
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct DumpCommand {
    /// Database basename (as given to count --output)
    #[arg(short, long)]
    pub input: String,
}

impl CountCommand {
    pub fn to_params(&self) -> Result<Params, String> {
        let mut input_paths = Vec::new();
        for input in &self.inputs {
            if let Some(list) = input.strip_prefix('@') {
                let paths = ktio::fops::read_input_list(list)
                    .map_err(|e| format!("cannot read list file {}: {}", list, e))?;
                input_paths.extend(paths);
            } else {
                input_paths.push(input.clone());
            }
        }
        Ok(Params {
            input_paths,
            output_base: PathBuf::from(&self.output),
            working_dir: PathBuf::from(&self.tmp_dir),
            kmer_len: self.k_size as usize,
            signature_len: self.sig_len as usize,
            max_mem_gb: self.memory,
            cutoff_min: self.cutoff_min,
            cutoff_max: self.cutoff_max,
            counter_max: self.counter_max,
            both_strands: !self.no_canonical,
            file_format: self.format.to_seq_format(),
            n_bins: self.bins as usize,
            n_threads: self.threads,
            n_readers: self.n_readers,
            n_splitters: self.n_splitters,
            n_sorters: self.n_sorters,
            strict_memory: self.strict_memory,
            mem_mode: self.ram_only,
            sm_sorting_threads: self.sm_sorters,
            sm_uncompactor_threads: self.sm_uncompactors,
            sm_merger_threads: self.sm_mergers,
            keep_intermediates: self.keep_intermediates,
            kff_output: self.kff,
            json_summary: self.json_summary.as_ref().map(PathBuf::from),
            verbose: self.verbose,
        })
    }
}

pub fn cli(cli: Cli) {
    match cli.command {
        Commands::Count(command) => {
            let params = match command.to_params() {
                Ok(params) => params,
                Err(message) => {
                    eprintln!("Error: {}", message);
                    std::process::exit(1);
                }
            };
            match counter::count(&params) {
                Ok(summary) => {
                    eprintln!(
                        "Reads: {}  Unique k-mers: {}  Below min: {}  Above max: {}  Total k-mers: {}",
                        summary.n_reads,
                        summary.n_unique,
                        summary.n_below_min,
                        summary.n_above_max,
                        summary.n_total_kmers
                    );
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Dump(command) => {
            let base = PathBuf::from(&command.input);
            let result = counter::DbReader::open(&base).and_then(|reader| reader.records());
            match result {
                Ok(mut records) => {
                    records.sort();
                    let stdout = std::io::stdout();
                    let mut out = std::io::BufWriter::new(stdout.lock());
                    use std::io::Write;
                    for (kmer, count) in records {
                        if writeln!(out, "{}\t{}", kmer, count).is_err() {
                            std::process::exit(1);
                        }
                    }
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
