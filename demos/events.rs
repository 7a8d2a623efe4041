use clap::Parser as ClapParser;
use ctf_reader::metadata::{self, ast::Document, Outcome};
use ctf_reader::{IteratorStatus, MessageIterator, ReaderMedium};
use std::{fs, path::PathBuf};
use tracing::error;

/// ctf-reader events reader example
#[derive(Debug, clap::Parser)]
struct Opts {
    /// A JSON-encoded TSDL document (stands in for a real `.tsdl` front end)
    pub metadata: PathBuf,

    /// The binary CTF stream file
    pub stream: PathBuf,
}

fn main() {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let doc_str = fs::read_to_string(&opts.metadata).unwrap();
    let doc: Document = serde_json::from_str(&doc_str).unwrap();

    let trace = match metadata::resolve(&doc).unwrap() {
        Outcome::Complete(trace) => trace,
        Outcome::Incomplete => {
            error!("metadata document has no trace block");
            return;
        }
    };

    let stream = fs::File::open(&opts.stream).unwrap();
    let medium = ReaderMedium::new(stream);
    let mut it = MessageIterator::new(&trace, medium);

    loop {
        let (msgs, status) = match it.next(64) {
            Ok(r) => r,
            Err(e) => {
                error!("{e}");
                break;
            }
        };

        for msg in &msgs {
            println!("{msg:#?}");
        }

        if status == IteratorStatus::End {
            break;
        }
    }
}
