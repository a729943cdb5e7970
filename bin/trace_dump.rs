//! Prints the records of procnet trace files.
//!
//! Usage: `trace-dump <file>...`, where every file is a `.trace` or `.snd` stream.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use procnet::codec::Codec;
use procnet::trace;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("Usage: {} <file>...", args[0]);
        return;
    }

    let codec = Codec::new(BTreeMap::new());
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for path in &args[1..] {
        if let Err(e) = trace::dump(Path::new(path), &codec, &mut out) {
            eprintln!("{}: {}", path, e);
            std::process::exit(procnet::container::EXIT_TRACE);
        }
    }
}
