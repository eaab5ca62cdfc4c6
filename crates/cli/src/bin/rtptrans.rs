use std::process::ExitCode;

use clap::Parser;
use rtptools::translate::{DEFAULT_TTL, MAX_ENDPOINTS};
use rtptools::{Reactor, Relay, Translator, TranslatorConfig};
use rtptools_cli::{init_tracing, report, stop_on_signals};

#[derive(Parser)]
#[command(
    name = "rtptrans",
    about = "Relay RTP/RTCP between unicast and multicast endpoints, translating vat to RTP"
)]
struct Args {
    /// Log every relayed packet
    #[arg(short = 'd', long = "debug")]
    verbose: bool,

    /// `[host]/port[/ttl]` sides to relay between; ports must be even
    #[arg(required = true, num_args = 2..=MAX_ENDPOINTS, value_name = "ENDPOINT")]
    endpoints: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    report(run(args))
}

fn run(args: Args) -> rtptools::Result<()> {
    let config = TranslatorConfig::parse(&args.endpoints, DEFAULT_TTL)?;
    let mut reactor = Reactor::new(Relay::bind(Translator::new(config))?);
    Relay::register(&mut reactor)?;
    stop_on_signals(&mut reactor)?;
    reactor.run()?;

    let stats = reactor.state().translator().stats();
    tracing::info!(
        received = stats.received,
        forwarded = stats.forwarded,
        translated = stats.translated,
        dropped = stats.dropped,
        "relay stopped"
    );
    Ok(())
}
