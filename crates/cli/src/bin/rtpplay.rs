use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rtptools::net::UdpSink;
use rtptools::{CaptureReader, Endpoint, PayloadTable, Player, PlayoutConfig, Reactor};
use rtptools_cli::{init_tracing, parse_seconds, report, stop_on_signals};

/// Multicast TTL of replayed packets unless the destination names one.
const REPLAY_TTL: u8 = 1;

#[derive(Parser)]
#[command(name = "rtpplay", about = "Replay an rtpdump capture file")]
struct Args {
    /// Skip records captured before this many seconds
    #[arg(short, long, value_parser = parse_seconds)]
    begin: Option<Duration>,

    /// Stop after records captured this many seconds in
    #[arg(short, long, value_parser = parse_seconds)]
    end: Option<Duration>,

    /// Capture file to play (default: stdin)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Payload profile overriding clock rates: `<pt> <encoding> <rate> [channels]` per line
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Pace packets by capture time instead of RTP timestamps
    #[arg(short = 'T', long)]
    wallclock: bool,

    /// Send from this local port (and the next one for RTCP)
    #[arg(short, long)]
    source_port: Option<u16>,

    /// Log every packet sent
    #[arg(short, long)]
    verbose: bool,

    /// `[address]/port[/ttl]` to send to (default: the capture's source)
    destination: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    report(run(args))
}

fn run(args: Args) -> rtptools::Result<()> {
    let mut payloads = PayloadTable::standard();
    if let Some(path) = &args.profile {
        payloads.load_profile(path)?;
    }

    let input: Box<dyn BufRead> = match &args.file {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let reader = CaptureReader::new(input)?;

    let mut dest = match &args.destination {
        Some(d) => Endpoint::parse(d, REPLAY_TTL)?,
        None => {
            let header = reader.header();
            Endpoint {
                addr: header.source,
                port: header.port,
                ttl: REPLAY_TTL,
            }
        }
    };
    if dest.is_unspecified() {
        dest.addr = Ipv4Addr::LOCALHOST;
    }
    tracing::info!(%dest, "replaying");

    let sink = UdpSink::connect(&dest, args.source_port)?;
    let config = PlayoutConfig {
        begin: args.begin.unwrap_or_default(),
        end: args.end,
        wallclock: args.wallclock,
        ..PlayoutConfig::default()
    };
    let mut reactor = Reactor::new(Player::new(reader, sink, payloads, config));
    stop_on_signals(&mut reactor)?;
    Player::start(&mut reactor);
    reactor.run()?;

    let stats = reactor.state().stats();
    tracing::info!(
        read = stats.read,
        skipped = stats.skipped,
        sent = stats.sent,
        errors = stats.send_errors,
        "replay finished"
    );
    Ok(())
}
