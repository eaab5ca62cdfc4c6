//! Helpers shared by the `rtpdump`, `rtpplay` and `rtptrans` binaries.

use std::process::ExitCode;
use std::time::Duration;

use rtptools::Reactor;
use tracing_subscriber::filter::LevelFilter;

/// Log to stderr, keeping stdout free for tool output. `-v` shows debug
/// events.
pub fn init_tracing(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// Print `error: <e>` and map the outcome to an exit status.
pub fn report<E: std::fmt::Display>(result: Result<(), E>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Parse a non-negative number of seconds, fractions allowed.
pub fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("{s:?} is not a number"))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("{s:?} is not a valid duration"))
}

/// Parse a non-negative number of minutes, fractions allowed.
pub fn parse_minutes(s: &str) -> Result<Duration, String> {
    let minutes: f64 = s.parse().map_err(|_| format!("{s:?} is not a number"))?;
    Duration::try_from_secs_f64(minutes * 60.0)
        .map_err(|_| format!("{s:?} is not a valid duration"))
}

/// Stop `reactor` on SIGINT, SIGTERM or SIGHUP.
pub fn stop_on_signals<S: 'static>(reactor: &mut Reactor<S>) -> rtptools::Result<()> {
    for signum in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
        reactor.on_signal(signum, |r: &mut Reactor<S>, signum| {
            tracing::info!(signum, "stopping on signal");
            r.stop();
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_seconds("1.5"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_minutes("0.5"), Ok(Duration::from_secs(30)));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_minutes("soon").is_err());
    }
}
