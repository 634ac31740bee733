//! Audiobat - basic audio tester
//!
//! Plays a tone through a playback device, records it back and checks the
//! capture for the right frequency and enough signal-to-noise ratio.

use audiobat::audio::latency;
use audiobat::audio::loopback::{LoopbackBackend, LoopbackConfig};
use audiobat::audio::pcm::PcmBackend;
use audiobat::audio::pipeline::{self, CancelToken, CaptureAnalysis};
use audiobat::audio::wav;
use audiobat::cli::{self, Args};
use audiobat::report::SessionReport;
use audiobat::{BatError, Result, TestSession};
use clap::Parser;
use std::fs::File;
use std::process::ExitCode;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = cli::init_logging(args.log.as_deref()) {
        eprintln!("audiobat: {e}");
        return ExitCode::from(e.exit_code());
    }

    info!(
        "audiobat {} (built {})",
        audiobat::VERSION,
        audiobat::BUILD_DATE
    );

    if args.list {
        return match list_devices() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, stopping");
        handler_token.cancel();
    }) {
        warn!("Could not install Ctrl+C handler: {e}");
    }

    let mut report = None;
    let result = run(&args, &cancel, &mut report);

    let code = match &result {
        Ok(()) => {
            info!("Test passed");
            0
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };

    if let (Some(path), Some(mut report)) = (&args.report, report) {
        report.record_result(result.as_ref().map(|_| ()));
        if let Err(e) = report.write(path) {
            error!("{e}");
            if code == 0 {
                return ExitCode::from(e.exit_code());
            }
        }
    }
    info!("Return value is {code}");
    ExitCode::from(code)
}

fn run(args: &Args, cancel: &CancelToken, report: &mut Option<SessionReport>) -> Result<()> {
    let mut session = TestSession::new(args.to_config()?)?;
    if let Some(path) = session.config().input_file.clone() {
        let mut file = File::open(&path).map_err(|e| BatError::file(&path, e))?;
        wav::read_header_into(&mut file, &mut session)?;
    }

    info!(
        mode = ?session.mode(),
        format = %session.format(),
        channels = session.channels(),
        sample_rate = session.sample_rate(),
        frames = session.frames(),
        "Session configured"
    );
    for (channel, frequency) in session.target_frequencies().iter().enumerate() {
        info!(channel, frequency, "Target frequency");
    }

    let report = report.insert(SessionReport::new(&session));
    let backend = open_backend(&session)?;

    if session.config().round_trip_latency {
        let latency = latency::run_round_trip(&session, backend.as_ref(), cancel)?;
        info!(
            mean_ms = latency.mean_ms,
            attempts = latency.attempts,
            "Round trip latency measured"
        );
        report.latency = Some(latency);
        return Ok(());
    }

    let outcome = pipeline::run_session(&session, backend.as_ref(), cancel)?;
    report.record_outcome(&outcome);
    info!(
        played = outcome.frames_played,
        captured = outcome.frames_captured,
        "Transfer finished"
    );

    if session.config().standalone {
        info!("Standalone mode, skipping analysis");
        return Ok(());
    }
    let Some(path) = outcome.capture_path else {
        return Ok(());
    };
    info!(path = %path.display(), "Analyzing capture");

    let mut analysis = CaptureAnalysis::default();
    let result = pipeline::analyze_capture(&session, &path, &mut analysis);
    report.record_analysis(analysis);
    result
}

fn open_backend(session: &TestSession) -> Result<Box<dyn PcmBackend>> {
    if session.is_local() {
        // sound-card-like pacing keeps latency rounds reproducible
        let config = LoopbackConfig {
            realtime: session.config().round_trip_latency,
            ..LoopbackConfig::default()
        };
        return Ok(Box::new(LoopbackBackend::for_session(session, config)));
    }
    hardware_backend()
}

#[cfg(feature = "hardware")]
fn hardware_backend() -> Result<Box<dyn PcmBackend>> {
    Ok(Box::new(audiobat::audio::hardware::CpalBackend::new()))
}

#[cfg(not(feature = "hardware"))]
fn hardware_backend() -> Result<Box<dyn PcmBackend>> {
    Err(BatError::Configuration(
        "built without sound card support, use --local or the `hardware` feature".into(),
    ))
}

#[cfg(feature = "hardware")]
fn list_devices() -> anyhow::Result<()> {
    use anyhow::Context;
    use audiobat::audio::hardware::CpalBackend;
    use audiobat::audio::pcm::Direction;

    for direction in [Direction::Playback, Direction::Capture] {
        let names = CpalBackend::device_names(direction)
            .with_context(|| format!("Failed to enumerate {direction} devices"))?;
        println!("{direction} devices:");
        for name in names {
            println!("  {name}");
        }
    }
    Ok(())
}

#[cfg(not(feature = "hardware"))]
fn list_devices() -> anyhow::Result<()> {
    println!("Only the local loopback is available in this build");
    Ok(())
}
