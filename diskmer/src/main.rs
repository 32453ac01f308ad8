mod args;

use clap::Parser;

fn main() {
    args::cli(args::Cli::parse());
}
