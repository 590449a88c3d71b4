//! Datagram sources and the receive pipeline
//!
//! A [`Pipeline`] runs three threads joined by bounded queues:
//!
//! ```text
//! DatagramSource -> [datagram queue] -> FrameAssembler -> [frame queue] -> FrameSink
//! ```
//!
//! A slow sink therefore backs up the frame queue and then the datagram
//! queue, and only then the socket buffer; datagram ingestion never waits on
//! sink I/O directly. [`run_inline`] drives the same stages on the calling
//! thread for replay and tests.

use std::io;
use std::net::UdpSocket;
use std::sync::mpsc::{self as std_mpsc, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::capture::DatagramRecorder;
use crate::config::ReceiverConfig;
use crate::frame_assembler::{AssemblerStats, FrameAssembler, ProcessResult};
use crate::reassembly::AssembledFrame;
use crate::sink::FrameSink;

/// Largest possible UDP payload
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Pause after a failed receive before trying again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Errors raised by the receive pipeline.
#[derive(Error, Debug)]
pub enum ReceiverError {
    /// The UDP socket could not be bound or configured.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// `stop` was called on a pipeline that is no longer running.
    #[error("pipeline already stopped")]
    AlreadyStopped,

    /// A pipeline thread panicked.
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

/// Result type alias for receiver operations.
pub type Result<T> = std::result::Result<T, ReceiverError>;

/// Outcome of a single receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receive {
    /// A datagram of this many bytes was written to the buffer
    Datagram(usize),
    /// Nothing arrived before the read timeout
    TimedOut,
    /// The source has no more datagrams and never will
    Exhausted,
}

/// Producer of raw datagrams, one at a time
pub trait DatagramSource: Send {
    /// Receive the next datagram into `buf`
    ///
    /// Datagrams longer than `buf` are truncated.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying transport fails.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive>;
}

impl<T: DatagramSource + ?Sized> DatagramSource for Box<T> {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive> {
        (**self).receive(buf)
    }
}

/// UDP socket bound to the configured listen address
#[derive(Debug)]
pub struct UdpDatagramSource {
    socket: UdpSocket,
}

impl UdpDatagramSource {
    /// Bind `listen_ip:listen_port` with the configured read timeout
    ///
    /// # Errors
    ///
    /// Returns `ReceiverError::Bind` if the socket cannot be bound or its
    /// timeout cannot be set.
    pub fn bind(config: &ReceiverConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let bind_error = |source| ReceiverError::Bind {
            addr: addr.clone(),
            source,
        };

        let socket = UdpSocket::bind(&addr).map_err(bind_error)?;
        socket
            .set_read_timeout(Some(config.read_timeout()))
            .map_err(bind_error)?;

        log::info!("Listening for GVSP datagrams on {}", addr);
        Ok(Self { socket })
    }

    /// Address the socket is actually bound to
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be queried.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSource for UdpDatagramSource {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(Receive::Datagram(len)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(Receive::TimedOut)
            }
            Err(e) => Err(e),
        }
    }
}

/// Summary of a finished pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Datagrams read from the source
    pub datagrams_received: u64,
    /// Non-timeout errors reported by the source
    pub receive_errors: u64,
    /// Assembler counters at shutdown
    pub assembler: AssemblerStats,
    /// Frames the sink accepted
    pub frames_delivered: u64,
    /// Frames the sink rejected
    pub sink_failures: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReceiveCounters {
    datagrams: u64,
    errors: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SinkCounters {
    delivered: u64,
    failures: u64,
}

/// Running three-stage receive pipeline
pub struct Pipeline {
    stop_sender: Option<std_mpsc::Sender<()>>,
    receive_handle: Option<JoinHandle<ReceiveCounters>>,
    assemble_handle: Option<JoinHandle<AssemblerStats>>,
    sink_handle: Option<JoinHandle<SinkCounters>>,
}

impl Pipeline {
    /// Spawn the receive, assembly and sink threads
    ///
    /// Every datagram is recorded into `capture` (when given) before it is
    /// queued for assembly.
    pub fn start<S, K>(
        source: S,
        sink: K,
        config: &ReceiverConfig,
        capture: Option<Arc<DatagramRecorder>>,
    ) -> Self
    where
        S: DatagramSource + 'static,
        K: FrameSink + 'static,
    {
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let (datagram_tx, datagram_rx) = mpsc::channel(config.datagram_queue_capacity.max(1));
        let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_capacity.max(1));

        let assembler = FrameAssembler::from_config(config);
        let buffer_size = config.buffer_size;
        let frame_capture = capture.clone();

        let receive_handle = thread::spawn(move || {
            receive_loop(source, buffer_size, datagram_tx, stop_rx, capture)
        });
        let assemble_handle =
            thread::spawn(move || assemble_loop(assembler, datagram_rx, frame_tx, frame_capture));
        let sink_handle = thread::spawn(move || sink_loop(sink, frame_rx));

        log::info!(
            "Pipeline started ({}x{}, datagram queue {}, frame queue {})",
            config.width,
            config.height,
            config.datagram_queue_capacity,
            config.frame_queue_capacity
        );

        Self {
            stop_sender: Some(stop_tx),
            receive_handle: Some(receive_handle),
            assemble_handle: Some(assemble_handle),
            sink_handle: Some(sink_handle),
        }
    }

    /// Whether every stage has exited (a finite source ran dry)
    pub fn is_finished(&self) -> bool {
        [
            self.receive_handle.as_ref().map(JoinHandle::is_finished),
            self.assemble_handle.as_ref().map(JoinHandle::is_finished),
            self.sink_handle.as_ref().map(JoinHandle::is_finished),
        ]
        .into_iter()
        .all(|done| done.unwrap_or(true))
    }

    /// Signal stop, wait for all stages to drain and report
    ///
    /// Datagrams already queued are still assembled and frames already
    /// queued are still delivered. A collection left open is abandoned.
    ///
    /// # Errors
    ///
    /// Returns `ReceiverError::AlreadyStopped` on a second call and
    /// `ReceiverError::ThreadPanicked` naming the first stage that panicked.
    /// Every stage is joined before a panic is reported.
    pub fn stop(&mut self) -> Result<PipelineReport> {
        let stop_tx = self
            .stop_sender
            .take()
            .ok_or(ReceiverError::AlreadyStopped)?;
        let _ = stop_tx.send(());

        let receive = join(self.receive_handle.take(), "receive");
        let assembler = join(self.assemble_handle.take(), "assembly");
        let sink = join(self.sink_handle.take(), "sink");
        let (receive, assembler, sink) = (receive?, assembler?, sink?);

        let report = PipelineReport {
            datagrams_received: receive.datagrams,
            receive_errors: receive.errors,
            assembler,
            frames_delivered: sink.delivered,
            sink_failures: sink.failures,
        };

        log::info!(
            "Pipeline stopped: {} datagrams, {} frames delivered, {} dropped, {} sink failures",
            report.datagrams_received,
            report.frames_delivered,
            report.assembler.frames_dropped,
            report.sink_failures
        );
        Ok(report)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.stop_sender.is_some() {
            let _ = self.stop();
        }
    }
}

fn join<T: Default>(handle: Option<JoinHandle<T>>, stage: &'static str) -> Result<T> {
    let Some(handle) = handle else {
        return Ok(T::default());
    };
    handle.join().map_err(|_| {
        log::error!("Pipeline {} thread panicked", stage);
        ReceiverError::ThreadPanicked(stage)
    })
}

/// Stop was requested, or the pipeline handle is gone
fn stop_requested(stop_rx: &std_mpsc::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

fn receive_loop<S: DatagramSource>(
    mut source: S,
    buffer_size: usize,
    datagram_tx: mpsc::Sender<Vec<u8>>,
    stop_rx: std_mpsc::Receiver<()>,
    mut capture: Option<Arc<DatagramRecorder>>,
) -> ReceiveCounters {
    let mut buf = vec![0u8; buffer_size];
    let mut counters = ReceiveCounters::default();

    loop {
        if stop_requested(&stop_rx) {
            log::debug!("Receive thread received stop signal");
            break;
        }

        match source.receive(&mut buf) {
            Ok(Receive::Datagram(len)) => {
                let datagram = &buf[..len.min(buf.len())];
                counters.datagrams += 1;
                if let Some(Err(e)) = capture.as_ref().map(|c| c.record_datagram(datagram)) {
                    log::error!("Capture stopped: {}", e);
                    capture = None;
                }
                if datagram_tx.blocking_send(datagram.to_vec()).is_err() {
                    log::warn!("Assembly stage closed, stopping receive");
                    break;
                }
            }
            Ok(Receive::TimedOut) => {}
            Ok(Receive::Exhausted) => {
                log::info!("Datagram source exhausted after {} datagrams", counters.datagrams);
                break;
            }
            Err(e) => {
                counters.errors += 1;
                log::warn!("Receive failed: {}", e);
                thread::sleep(RECEIVE_ERROR_BACKOFF);
            }
        }
    }

    counters
}

fn assemble_loop(
    mut assembler: FrameAssembler,
    mut datagram_rx: mpsc::Receiver<Vec<u8>>,
    frame_tx: mpsc::Sender<AssembledFrame>,
    capture: Option<Arc<DatagramRecorder>>,
) -> AssemblerStats {
    while let Some(datagram) = datagram_rx.blocking_recv() {
        if let ProcessResult::Frame(frame) = assembler.process_datagram(&datagram) {
            if let Some(capture) = &capture {
                capture.record_frame();
            }
            if frame_tx.blocking_send(frame).is_err() {
                log::warn!("Sink stage closed, stopping assembly");
                break;
            }
        }
    }

    assembler.reset();
    *assembler.stats()
}

fn sink_loop<K: FrameSink>(
    mut sink: K,
    mut frame_rx: mpsc::Receiver<AssembledFrame>,
) -> SinkCounters {
    let mut counters = SinkCounters::default();

    while let Some(frame) = frame_rx.blocking_recv() {
        deliver(&mut sink, frame, &mut counters);
    }

    if let Err(e) = sink.finish() {
        log::warn!("Sink finish failed: {}", e);
    }
    counters
}

fn deliver<K: FrameSink + ?Sized>(
    sink: &mut K,
    frame: AssembledFrame,
    counters: &mut SinkCounters,
) {
    let block_id = frame.block_id;
    match sink.accept(frame) {
        Ok(()) => counters.delivered += 1,
        Err(e) => {
            counters.failures += 1;
            log::warn!("Sink rejected block {}: {}", block_id, e);
        }
    }
}

/// Drive source, assembler and sink on the calling thread until the source
/// is exhausted
///
/// The sink is finished before returning and any open collection is
/// abandoned.
///
/// # Errors
///
/// Returns the first I/O error reported by the source.
pub fn run_inline<S, K>(
    source: &mut S,
    assembler: &mut FrameAssembler,
    sink: &mut K,
) -> io::Result<PipelineReport>
where
    S: DatagramSource + ?Sized,
    K: FrameSink + ?Sized,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut datagrams = 0u64;
    let mut counters = SinkCounters::default();

    loop {
        match source.receive(&mut buf)? {
            Receive::Datagram(len) => {
                datagrams += 1;
                if let ProcessResult::Frame(frame) =
                    assembler.process_datagram(&buf[..len.min(buf.len())])
                {
                    deliver(sink, frame, &mut counters);
                }
            }
            Receive::TimedOut => {}
            Receive::Exhausted => break,
        }
    }

    assembler.reset();
    if let Err(e) = sink.finish() {
        log::warn!("Sink finish failed: {}", e);
    }

    Ok(PipelineReport {
        datagrams_received: datagrams,
        receive_errors: 0,
        assembler: *assembler.stats(),
        frames_delivered: counters.delivered,
        sink_failures: counters.failures,
    })
}
