//! Decode a baseline JPEG file and write it out as a plain PPM/PGM, in the
//! same `clap`+`stderrlog` shape as the teacher's `examples/*.rs` binaries.

use anyhow::Result;
use clap::Parser;
use std::io::Write;

use streamrt::event_loop::EventLoop;
use streamrt::jpeg::JpegDecoder;
use streamrt::stream::MemoryInputStream;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Input JPEG file.
    input: String,

    /// Output PPM (3 components) or PGM (1 component) file.
    output: String,

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

    let image = JpegDecoder::new(source)
        .decode_sync(&event_loop)
        .map_err(|e| anyhow::anyhow!(e))?;

    log::info!(
        "decoded {}x{} image, {} component(s)",
        image.width,
        image.height,
        image.n_components
    );

    let mut out = std::fs::File::create(&opt.output)?;
    match image.n_components {
        1 => write!(out, "P5\n{} {}\n255\n", image.width, image.height)?,
        3 => write!(out, "P6\n{} {}\n255\n", image.width, image.height)?,
        n => anyhow::bail!("cannot write a PPM/PGM for a {n}-component image"),
    }
    out.write_all(&image.data)?;
    Ok(())
}
