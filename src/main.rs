//! `crossquery` binary: runs a query over a fixture file. See [`cli`].

use crossquery::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
