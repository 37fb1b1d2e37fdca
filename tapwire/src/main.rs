use tapwire_core::config::{default_config, load_config};
use tapwire_core::output::records::{BaseEntry, Entry, ResolvedNames};
use tapwire_core::output::sink::OutputSink;
use tapwire_core::output::OutputItem;
use tapwire_core::protocols::stream::ProtocolRegistry;
use tapwire_core::stats;
use tapwire_core::{OfflineSource, Runtime, SegmentSource};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;

// Define command-line arguments.
#[derive(Parser, Debug)]
#[clap(about = "Pairs requests and responses found in packet captures")]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
    #[clap(
        short,
        long,
        parse(from_os_str),
        value_name = "FILE",
        default_value = "entries.jsonl"
    )]
    outfile: PathBuf,
    /// Protocols to dissect, in any order. Defaults to every supported protocol.
    #[clap(short, long, value_delimiter = ',', value_name = "NAME")]
    protocols: Vec<String>,
    /// Extra `host` or `host:port` targets, added to the configured ones.
    #[clap(short, long, value_name = "AUTHORITY")]
    target: Vec<String>,
    #[clap(parse(from_os_str), required = true, value_name = "PCAP")]
    pcaps: Vec<PathBuf>,
}

#[derive(Serialize)]
struct LogLine<'a> {
    entry: &'a Entry,
    summary: &'a BaseEntry,
}

fn protocols(names: &[String]) -> Result<ProtocolRegistry> {
    if names.is_empty() {
        Ok(ProtocolRegistry::all())
    } else {
        ProtocolRegistry::from_names(names)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    config.apply_env();
    config.targets.extend(args.target.iter().cloned());
    config.validate()?;

    let sources = args
        .pcaps
        .iter()
        .map(|path| {
            OfflineSource::open(path, &config.offline)
                .map(|source| Box::new(source) as Box<dyn SegmentSource>)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let sink: OutputSink<OutputItem> = OutputSink::new(config.output.sink_capacity);
    let items = sink.receiver();
    let analyzers = protocols(&args.protocols)?;
    // Use `BufWriter` to improve the speed of repeated write calls to the same file.
    let mut wtr = BufWriter::new(File::create(&args.outfile)?);
    let writer = thread::Builder::new()
        .name("tapwire-writer".to_owned())
        .spawn(move || -> Result<usize> {
            let names = ResolvedNames::default();
            let mut cnt = 0;
            for item in items.iter() {
                let parser = match analyzers.get(item.protocol) {
                    Some(parser) => parser,
                    None => continue,
                };
                let entry = parser.analyze(&item, &names);
                let summary = parser.summarize(&entry);
                let line = LogLine {
                    entry: &entry,
                    summary: &summary,
                };
                serde_json::to_writer(&mut wtr, &line)?;
                wtr.write_all(b"\n")?;
                cnt += 1;
            }
            wtr.flush()?;
            Ok(cnt)
        })?;

    let runtime = Runtime::new(config, protocols(&args.protocols)?, sink)?;
    let summary = runtime.run(sources)?;
    // closes the sink, ending the writer
    drop(runtime);
    let cnt = writer
        .join()
        .map_err(|_| anyhow!("writer thread panicked"))??;

    for source in &summary.sources {
        if let Some(error) = &source.error {
            log::error!("{}: {}", source.name, error);
        }
    }
    let snapshot = stats::snapshot();
    log::info!("{}", serde_json::to_string(&snapshot)?);
    println!(
        "Done. Processed {} frames ({} bytes), logged {} entries to {:?}",
        summary.frames(),
        summary.bytes(),
        cnt,
        &args.outfile
    );
    Ok(())
}
