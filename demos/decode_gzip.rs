//! Decode a gzip or zlib stream from a file and write the result to
//! stdout, in the same `clap`+`stderrlog` shape as the teacher's
//! `examples/*.rs` binaries.

use anyhow::Result;
use clap::Parser;
use std::io::Write;

use streamrt::event_loop::EventLoop;
use streamrt::gzip::{GzipDecoder, ZlibDecoder};
use streamrt::stream::{read_all_sync, MemoryInputStream};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Input file, gzip- or zlib-compressed.
    input: String,

    /// Treat the input as zlib (RFC 1950) instead of gzip (RFC 1952).
    #[arg(long)]
    zlib: bool,

    #[arg(short, default_value = "2")]
    verbose: usize,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .quiet(false)
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let data = std::fs::read(&opt.input)?;
    let source = MemoryInputStream::new(data);
    let event_loop = EventLoop::new();

    let decoded = if opt.zlib {
        read_all_sync(ZlibDecoder::new(source), &event_loop)?
    } else {
        read_all_sync(GzipDecoder::new(source), &event_loop)?
    };

    std::io::stdout().write_all(&decoded)?;
    Ok(())
}
