//! `gvsp-receiver` - GigE Vision stream receiver
//!
//! Receives GVSP datagrams over UDP, reassembles them into frames and hands
//! the frames to logging and recording sinks.

pub mod capture;
pub mod config;
pub mod frame_assembler;
pub mod frame_validation;
pub mod gvsp_header;
pub mod reassembly;
pub mod receiver;
pub mod replay;
pub mod sink;
pub mod test_utils;

use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::capture::{CaptureMetadata, DatagramRecorder};
use crate::config::ReceiverConfig;
use crate::receiver::{DatagramSource, Pipeline, PipelineReport, UdpDatagramSource};
use crate::replay::{ReplayConfig, ReplaySource};
use crate::sink::{FrameSink, LoggingSink, MultiSink, SegmentRecorder};

/// Frames between progress lines from the logging sink
const LOG_REPORT_EVERY: u64 = 30;

/// How often the main thread checks for a finished source
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run the receiver until the operator quits or a replay source runs dry
///
/// The configuration path is the first command-line argument, falling back
/// to `GVSP_CONFIG`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the datagram source
/// cannot be opened, or the pipeline fails to shut down cleanly.
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("gvsp-receiver starting up");

    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("GVSP_CONFIG"))
        .map(PathBuf::from);
    let mut config = ReceiverConfig::resolve(config_path.as_deref())
        .context("failed to load configuration")?;

    let source = open_source(&mut config)?;
    let capture = start_capture(&config)?;
    let sink = build_sink(&config);

    let mut pipeline = Pipeline::start(source, sink, &config, capture.clone());
    wait_for_quit(&pipeline);

    let report = pipeline.stop().context("pipeline shutdown failed")?;
    log_report(&report);

    if let Some(capture) = capture {
        save_capture(&capture);
    }

    Ok(())
}

/// Open the replay file when configured, otherwise bind the UDP socket
///
/// Geometry recorded with a capture replaces the configured geometry.
fn open_source(config: &mut ReceiverConfig) -> anyhow::Result<Box<dyn DatagramSource>> {
    let Some(path) = config.replay_path.clone() else {
        let source = UdpDatagramSource::bind(config)?;
        return Ok(Box::new(source));
    };

    let source = ReplaySource::load_with_config(
        &path,
        ReplayConfig {
            speed: config.replay_speed,
            loop_playback: false,
        },
    )
    .with_context(|| format!("failed to load replay {}", path.display()))?;

    if let Some(geometry) = source.geometry() {
        if geometry != config.geometry() {
            log::info!(
                "Using {}x{} from capture metadata instead of configured {}x{}",
                geometry.width,
                geometry.height,
                config.width,
                config.height
            );
            config.width = geometry.width;
            config.height = geometry.height;
        }
    }

    log::info!(
        "Replaying {} datagrams ({} ms) from {}",
        source.datagram_count(),
        source.duration_ms(),
        path.display()
    );
    Ok(Box::new(source))
}

fn start_capture(config: &ReceiverConfig) -> anyhow::Result<Option<Arc<DatagramRecorder>>> {
    let Some(dir) = config.capture_dir.as_deref() else {
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create capture directory {}", dir.display()))?;

    let metadata = CaptureMetadata {
        source: config
            .replay_path
            .as_ref()
            .map_or_else(|| config.listen_addr(), |p| p.display().to_string()),
        width: config.width,
        height: config.height,
        ..Default::default()
    };
    let recorder =
        DatagramRecorder::create(dir, metadata)?.with_max_bytes(config.capture_max_bytes);
    Ok(Some(Arc::new(recorder)))
}

fn build_sink(config: &ReceiverConfig) -> MultiSink {
    let mut sink = MultiSink::new();
    sink.push(Box::new(LoggingSink::new(LOG_REPORT_EVERY)));

    if let Some(dir) = &config.output_dir {
        log::info!(
            "Recording {}s segments to {}",
            config.segment_duration_secs,
            dir.display()
        );
        let recorder: Box<dyn FrameSink> =
            Box::new(SegmentRecorder::new(dir.clone(), config.segment_duration()));
        sink.push(recorder);
    }

    sink
}

/// Block until `q` is typed, Ctrl-C arrives, or the pipeline finishes
///
/// Closing stdin also quits, but only when stdin is a terminal. Under a
/// service manager or with input redirected from `/dev/null` the receiver
/// keeps running until interrupted.
fn wait_for_quit(pipeline: &Pipeline) {
    let (quit_tx, quit_rx) = mpsc::channel();

    let interrupt_tx = quit_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        log::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let quit_on_eof = std::io::stdin().is_terminal();
    let stdin_tx = quit_tx.clone();
    std::thread::spawn(move || {
        if quit_requested(std::io::stdin().lock(), quit_on_eof) {
            let _ = stdin_tx.send(());
        } else {
            log::debug!("stdin closed, waiting for Ctrl-C or the end of the source");
        }
    });

    if quit_on_eof {
        log::info!("Receiving; type 'q' and Enter or press Ctrl-C to stop");
    } else {
        log::info!("Receiving; send SIGINT to stop");
    }

    // `quit_tx` stays alive here, so the channel never disconnects
    loop {
        if quit_rx.recv_timeout(POLL_INTERVAL).is_ok() {
            log::info!("Stop requested");
            return;
        }
        if pipeline.is_finished() {
            log::info!("Datagram source finished");
            return;
        }
    }
}

/// Read operator input until `q`; end of input counts only if `quit_on_eof`
fn quit_requested<R: BufRead>(input: R, quit_on_eof: bool) -> bool {
    for line in input.lines() {
        match line {
            Ok(line) if line.trim().eq_ignore_ascii_case("q") => return true,
            Ok(_) => {}
            Err(e) => {
                log::warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
    quit_on_eof
}

fn save_capture(capture: &DatagramRecorder) {
    match capture.finish() {
        Ok(result) => log::info!(
            "Capture saved to {} ({} datagrams)",
            result.datagrams_path.display(),
            result.metadata.total_datagrams
        ),
        Err(e) => log::error!("Failed to save capture: {}", e),
    }
}

fn log_report(report: &PipelineReport) {
    match serde_json::to_string(report) {
        Ok(json) => log::info!("Session report: {}", json),
        Err(e) => log::warn!("Failed to serialize session report: {}", e),
    }
}
