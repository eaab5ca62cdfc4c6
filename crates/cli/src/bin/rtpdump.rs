use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, UNIX_EPOCH};

use clap::Parser;
use rtptools::dump::{self, DEFAULT_EVENT_PAYLOAD_TYPE, Listener};
use rtptools::translate::DEFAULT_TTL;
use rtptools::{
    CaptureHeader, CaptureReader, DumpConfig, DumpFormat, Endpoint, Reactor, Recorder,
};
use rtptools_cli::{init_tracing, parse_minutes, report, stop_on_signals};

#[derive(Parser)]
#[command(
    name = "rtpdump",
    about = "Record or decode RTP/RTCP traffic from the network or a capture file"
)]
struct Args {
    /// Output format: dump, header, hex, rtcp, short, payload or ascii
    /// (any unique prefix)
    #[arg(short = 'F', long, default_value = "ascii")]
    format: DumpFormat,

    /// Read this capture file instead of the network (default: stdin)
    #[arg(short = 'f', long)]
    input: Option<PathBuf>,

    /// Write to this file instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Stop recording after this many minutes
    #[arg(short = 't', long, value_parser = parse_minutes)]
    minutes: Option<Duration>,

    /// Payload bytes kept by `dump` and shown by `hex`
    #[arg(short = 'x', long, value_parser = clap::value_parser!(u32).range(1..))]
    truncate: Option<u32>,

    /// Payload type decoded as telephone events
    #[arg(short = 'd', long, default_value_t = DEFAULT_EVENT_PAYLOAD_TYPE,
          value_parser = clap::value_parser!(u8).range(0..128))]
    event_payload: u8,

    /// Log debug detail to stderr
    #[arg(short, long)]
    verbose: bool,

    /// `[address]/port` to listen on; without it a capture is read
    endpoint: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    report(run(args))
}

fn run(args: Args) -> rtptools::Result<()> {
    let config = DumpConfig {
        format: args.format,
        truncate: args
            .truncate
            .map_or(DumpConfig::default().truncate, |n| n as usize),
        duration: args.minutes,
        event_payload_type: args.event_payload,
    };
    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let out = BufWriter::new(out);

    let Some(endpoint) = args.endpoint else {
        let input: Box<dyn Read> = match &args.input {
            Some(path) => Box::new(File::open(path)?),
            None => Box::new(io::stdin()),
        };
        let mut reader = CaptureReader::new(BufReader::new(input))?;
        let header = *reader.header();
        let mut recorder = Recorder::new(out, config, &header, Duration::ZERO)?;
        let records = dump::dump_capture(&mut reader, &mut recorder)?;
        tracing::info!(records, "capture decoded");
        return Ok(());
    };

    let endpoint = Endpoint::parse(&endpoint, DEFAULT_TTL)?;
    let start = dump::now();
    let header = CaptureHeader::starting_at(UNIX_EPOCH + start, endpoint.addr, endpoint.port);
    let recorder = Recorder::new(out, config, &header, start)?;

    let mut reactor = Reactor::new(Listener::bind(&endpoint, recorder)?);
    Listener::register(&mut reactor)?;
    stop_on_signals(&mut reactor)?;
    reactor.run()?;

    let recorder = reactor.into_state().finish()?;
    let stats = recorder.stats();
    tracing::info!(data = stats.data, control = stats.control, "recording finished");
    Ok(())
}
