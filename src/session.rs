//! Capture session: construction, supervision, and teardown.
//!
//! A [`CaptureSession`] is the explicit context object for one capture run.
//! [`CaptureSession::start`] validates configuration eagerly, binds the
//! sockets, opens the archive container, spawns the four workers, and
//! issues the bootstrap metadata:
//!
//! ```text
//! Receiver ─► queue ─► Assembler ─► (Scaler) ─┬─► Archive Writer
//!                                             └─► Aggregate Publisher
//! ```
//!
//! The two fan-out channels are independent so a slow disk never delays the
//! display feed, and vice versa; a consumer that falls behind loses frames
//! (counted) rather than stalling the assembler.
//!
//! Supervision: the receiver and publisher can fail fatally (transport).
//! The first fatal error triggers the stop signal, the receiver injects the
//! queue sentinel, everything drains in order, and [`CaptureSession::wait`]
//! surfaces the error. In-flight partial frames are discarded on shutdown,
//! not flushed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::archive::{spawn_archive_task, DEFAULT_CHANNEL_CAPACITY};
use crate::assembler::{AssemblerConfig, FlushedFrame, FrameAssembler};
use crate::config::{CaptureConfig, ConfigSnapshot};
use crate::control::DescriptorIssuer;
use crate::counters::{bump, CounterSnapshot, SessionCounters};
use crate::error::{CaptureError, Result};
use crate::protocol::{Contribution, DescriptorRegistry};
use crate::publisher::{spawn_publisher_task, AggregatePublisher};
use crate::queue::DropOldestQueue;
use crate::receiver::HeapReceiver;
use crate::scaler::Scaler;

/// Cloneable handle that signals session shutdown from any task.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Signal shutdown; idempotent.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// A running capture session.
pub struct CaptureSession {
    counters: Arc<SessionCounters>,
    issuer: DescriptorIssuer,
    listen_addr: SocketAddr,
    stop_tx: Arc<watch::Sender<bool>>,
    fatal_rx: mpsc::UnboundedReceiver<CaptureError>,
    receiver_task: JoinHandle<()>,
    assembler_task: JoinHandle<()>,
    archive_task: JoinHandle<Result<()>>,
    publisher_task: JoinHandle<()>,
}

impl CaptureSession {
    /// Validate configuration, bind everything, spawn the workers, and
    /// issue the bootstrap metadata.
    ///
    /// Fails fast on invalid configuration, socket binds, or an unwritable
    /// archive path — nothing starts half-way.
    pub async fn start(config: CaptureConfig, snapshot: ConfigSnapshot) -> Result<Self> {
        config.validate()?;
        snapshot.validate()?;
        let scaler = Scaler::new(f64::from(snapshot.accumulation_length), config.normalize)?;

        let counters = Arc::new(SessionCounters::new());
        let registry = Arc::new(DescriptorRegistry::with_standard(snapshot.channel_count));
        let queue = Arc::new(DropOldestQueue::new(config.queue_capacity));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let receiver = HeapReceiver::bind(
            config.listen_addr,
            snapshot.clone(),
            registry.clone(),
            queue.clone(),
            counters.clone(),
            stop_rx,
        )
        .await?;
        let listen_addr = receiver.local_addr()?;

        // Archive container open for the session's lifetime; the task owns
        // it and closes it on every exit path.
        let archive_file = tokio::fs::File::create(&config.archive_path)
            .await
            .map_err(CaptureError::Storage)?;

        let (archive_tx, archive_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (publish_tx, publish_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        let archive_task =
            spawn_archive_task(archive_file, snapshot.clone(), archive_rx, counters.clone());

        let publisher = AggregatePublisher::bind(
            config.publish_addr,
            config.max_packet_payload,
            counters.clone(),
        )
        .await?;
        let publisher_inner = spawn_publisher_task(publisher, publish_rx);
        let publisher_task = tokio::spawn({
            let fatal_tx = fatal_tx.clone();
            async move {
                if let Ok(Err(e)) = publisher_inner.await {
                    warn!(error = %e, "publisher failed");
                    let _ = fatal_tx.send(e);
                }
            }
        });

        let assembler = FrameAssembler::new(
            AssemblerConfig {
                engine_count: snapshot.engine_count,
                window: config.window,
                flush_timeout: Duration::from_millis(config.flush_timeout_ms),
            },
            registry.clone(),
            counters.clone(),
        );
        let assembler_task = tokio::spawn(assembler_loop(
            assembler,
            queue.clone(),
            scaler,
            archive_tx,
            publish_tx,
            counters.clone(),
            Duration::from_millis(config.flush_timeout_ms),
        ));

        let receiver_task = tokio::spawn({
            let fatal_tx = fatal_tx.clone();
            async move {
                if let Err(e) = receiver.run().await {
                    warn!(error = %e, "receiver failed");
                    let _ = fatal_tx.send(e);
                }
            }
        });
        drop(fatal_tx);

        // Bootstrap the display consumer before data flows.
        let issuer = DescriptorIssuer::new(config.publish_addr, snapshot, registry)?;
        issuer.issue_all()?;

        info!(listen = %listen_addr, publish = %config.publish_addr, "capture session started");

        Ok(Self {
            counters,
            issuer,
            listen_addr,
            stop_tx: Arc::new(stop_tx),
            fatal_rx,
            receiver_task,
            assembler_task,
            archive_task,
            publisher_task,
        })
    }

    /// The receiver's bound address (useful when configured with port 0).
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// The control-plane issuer, for on-demand reissue of bootstrap
    /// metadata.
    pub fn issuer(&self) -> &DescriptorIssuer {
        &self.issuer
    }

    /// Point-in-time diagnostics counters.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Signal shutdown: the receive loop stops and the pipeline drains.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// A handle that can stop this session from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Wait for the session to finish.
    ///
    /// Blocks until a fatal worker error or an orderly [`stop`]-initiated
    /// drain; joins every worker either way and returns the first fatal
    /// error, if any.
    ///
    /// [`stop`]: CaptureSession::stop
    pub async fn wait(mut self) -> Result<()> {
        // None means every fatal-capable worker exited cleanly.
        let fatal = self.fatal_rx.recv().await;
        let _ = self.stop_tx.send(true);

        let _ = self.receiver_task.await;
        let _ = self.assembler_task.await;
        let _ = self.archive_task.await;
        let _ = self.publisher_task.await;

        match fatal {
            Some(e) => Err(e),
            None => {
                info!("capture session stopped");
                Ok(())
            }
        }
    }
}

/// Assembler worker: queue in, ordered flushes out to both consumers.
async fn assembler_loop(
    mut assembler: FrameAssembler,
    queue: Arc<DropOldestQueue<Contribution>>,
    scaler: Scaler,
    archive_tx: mpsc::Sender<FlushedFrame>,
    publish_tx: mpsc::Sender<FlushedFrame>,
    counters: Arc<SessionCounters>,
    flush_timeout: Duration,
) {
    // Age checks run a few times per timeout so a stuck frame flushes
    // promptly after its deadline.
    let check_period = Duration::from_millis((flush_timeout.as_millis() as u64 / 4).max(10));
    let mut ticker = tokio::time::interval(check_period);

    loop {
        tokio::select! {
            item = queue.pop() => match item {
                Some(contribution) => {
                    for frame in assembler.insert(contribution) {
                        deliver(frame, &scaler, &archive_tx, &publish_tx, &counters);
                    }
                }
                // Sentinel: discard in-flight partial frames and stop.
                None => break,
            },
            _ = ticker.tick() => {
                for frame in assembler.flush_aged(Instant::now()) {
                    deliver(frame, &scaler, &archive_tx, &publish_tx, &counters);
                }
            }
        }
    }

    if assembler.in_flight() > 0 {
        debug!(
            discarded = assembler.in_flight(),
            "shutdown: discarding in-flight partial frames"
        );
    }
    info!("assembler stopped");
    // Dropping the senders here drains and stops both consumers.
}

/// Hand one flushed frame to both consumers without ever blocking on them.
fn deliver(
    frame: FlushedFrame,
    scaler: &Scaler,
    archive_tx: &mpsc::Sender<FlushedFrame>,
    publish_tx: &mpsc::Sender<FlushedFrame>,
    counters: &SessionCounters,
) {
    let scaled = FlushedFrame {
        payload: scaler.apply(frame.payload.clone()),
        ..frame
    };

    match publish_tx.try_send(scaled.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(f)) => {
            warn!(counter = f.counter, "display feed backlogged, frame skipped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }

    match archive_tx.try_send(scaled) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(f)) => {
            warn!(counter = f.counter, "archive backlogged, frame record lost");
            bump(&counters.storage_errors);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(counter: u64) -> FlushedFrame {
        FlushedFrame {
            counter,
            timestamp_ms: counter,
            accumulation_length: 2,
            complete: true,
            parsed: true,
            payload: Bytes::from(2.0f32.to_be_bytes().to_vec()),
        }
    }

    #[tokio::test]
    async fn test_deliver_fans_out_scaled_frame() {
        let (archive_tx, mut archive_rx) = mpsc::channel(4);
        let (publish_tx, mut publish_rx) = mpsc::channel(4);
        let counters = SessionCounters::new();
        let scaler = Scaler::new(2.0, true).unwrap();

        deliver(frame(1), &scaler, &archive_tx, &publish_tx, &counters);

        let archived = archive_rx.recv().await.unwrap();
        let published = publish_rx.recv().await.unwrap();
        assert_eq!(archived.payload, published.payload);

        let value = f32::from_be_bytes(archived.payload[..4].try_into().unwrap());
        assert!((value - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_deliver_never_blocks_on_full_consumer() {
        let (archive_tx, _archive_rx) = mpsc::channel(1);
        let (publish_tx, mut publish_rx) = mpsc::channel(4);
        let counters = SessionCounters::new();
        let scaler = Scaler::identity();

        // Second frame overflows the archive channel but must still reach
        // the display feed.
        deliver(frame(1), &scaler, &archive_tx, &publish_tx, &counters);
        deliver(frame(2), &scaler, &archive_tx, &publish_tx, &counters);

        assert_eq!(publish_rx.recv().await.unwrap().counter, 1);
        assert_eq!(publish_rx.recv().await.unwrap().counter, 2);
        assert_eq!(counters.snapshot().storage_errors, 1);
    }

    #[tokio::test]
    async fn test_deliver_tolerates_closed_consumers() {
        let (archive_tx, _) = mpsc::channel(1);
        let (publish_tx, _) = mpsc::channel(1);
        let counters = SessionCounters::new();

        // Both receivers dropped: delivery is a no-op, not a panic.
        deliver(
            frame(1),
            &Scaler::identity(),
            &archive_tx,
            &publish_tx,
            &counters,
        );
    }
}
