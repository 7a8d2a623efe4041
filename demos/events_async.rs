use clap::Parser as ClapParser;
use ctf_reader::metadata::{self, ast::Document, Outcome};
use ctf_reader::{Error, MessageDecoder};
use std::{fs, path::PathBuf};
use tokio::fs::File;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::error;

/// ctf-reader events async reader example
#[derive(Debug, clap::Parser)]
struct Opts {
    /// A JSON-encoded TSDL document (stands in for a real `.tsdl` front end)
    pub metadata: PathBuf,

    /// The binary CTF stream file
    pub stream: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let doc_str = fs::read_to_string(&opts.metadata).unwrap();
    let doc: Document = serde_json::from_str(&doc_str).unwrap();

    let trace = match metadata::resolve(&doc)? {
        Outcome::Complete(trace) => trace,
        Outcome::Incomplete => {
            error!("metadata document has no trace block");
            return Ok(());
        }
    };

    let stream = File::open(&opts.stream).await.unwrap();

    let decoder = MessageDecoder::new(&trace);

    let mut reader = FramedRead::new(stream, decoder);

    while let Some(value) = reader.next().await {
        let msg = match value {
            Ok(m) => m,
            Err(e) => {
                error!("{e}");
                break;
            }
        };
        println!("{msg:#?}");
    }

    Ok(())
}
