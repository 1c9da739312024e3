//! Outbound side of the record transfer channel.
//!
//! [`TransferSender`] owns a background task that drains a bounded
//! frame queue onto a TCP connection. The connection is opened lazily
//! on the first frame; a failed write gets exactly one reconnect and
//! retry, after which the frame is dropped and counted. The switch
//! protocol tolerates this loss the same way it tolerates the overload
//! shortcut.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sluice_core::record::ControlFlag;
use sluice_core::strategy::RecordForwarder;
use sluice_core::{RecordCodec, SwitchConfig, SwitchMetrics, SwitchRecord, TransferError};

use crate::frame::{write_frame, TransferFrame};

/// A background transfer connection to one receiving node.
pub struct TransferSender {
    tx: mpsc::Sender<TransferFrame>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TransferSender {
    /// Spawns the sender task for `address`.
    ///
    /// No connection is made until the first frame is queued.
    #[must_use]
    pub fn start(address: String, config: &SwitchConfig, metrics: Arc<SwitchMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(config.transfer_buffer);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_sender(
            address,
            config.connect_timeout,
            rx,
            cancel.clone(),
            metrics,
        ));
        Self { tx, cancel, join }
    }

    /// A cloneable forwarding handle that serializes records with
    /// `codec` before queueing them.
    #[must_use]
    pub fn forwarder(&self, codec: Arc<dyn RecordCodec>) -> TransferForwarder {
        TransferForwarder {
            codec,
            tx: self.tx.clone(),
        }
    }

    /// Stops the sender after flushing whatever is already queued.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if self.join.await.is_err() {
            warn!("transfer sender task panicked");
        }
    }
}

impl std::fmt::Debug for TransferSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSender").finish_non_exhaustive()
    }
}

/// Forwarding handle over the sender's frame queue.
#[derive(Clone)]
pub struct TransferForwarder {
    codec: Arc<dyn RecordCodec>,
    tx: mpsc::Sender<TransferFrame>,
}

#[async_trait]
impl RecordForwarder for TransferForwarder {
    async fn forward_flag(&self, flag: ControlFlag) -> Result<(), TransferError> {
        self.tx
            .send(TransferFrame::Flag(flag))
            .await
            .map_err(|_| TransferError::ChannelClosed)
    }

    async fn forward(&self, record: SwitchRecord) -> Result<(), TransferError> {
        let bytes = self.codec.encode(&record)?;
        self.tx
            .send(TransferFrame::Record(bytes))
            .await
            .map_err(|_| TransferError::ChannelClosed)
    }
}

impl std::fmt::Debug for TransferForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferForwarder").finish_non_exhaustive()
    }
}

async fn run_sender(
    address: String,
    connect_timeout: Duration,
    mut rx: mpsc::Receiver<TransferFrame>,
    cancel: CancellationToken,
    metrics: Arc<SwitchMetrics>,
) {
    let mut conn: Option<TcpStream> = None;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                rx.close();
                // Flush frames that were queued before the shutdown.
                while let Some(frame) = rx.recv().await {
                    deliver(&mut conn, &address, connect_timeout, &frame, &metrics).await;
                }
                break;
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                deliver(&mut conn, &address, connect_timeout, &frame, &metrics).await;
            }
        }
    }
    info!(address = %address, "transfer sender stopped");
}

/// Delivers one frame with at most one reconnect, dropping it on the
/// second failure.
async fn deliver(
    conn: &mut Option<TcpStream>,
    address: &str,
    connect_timeout: Duration,
    frame: &TransferFrame,
    metrics: &SwitchMetrics,
) {
    match write_once(conn, address, connect_timeout, frame).await {
        Ok(()) => metrics.record_frame_sent(),
        Err(first) => {
            *conn = None;
            debug!(address = %address, error = %first, "transfer write failed; retrying once");
            match write_once(conn, address, connect_timeout, frame).await {
                Ok(()) => metrics.record_frame_sent(),
                Err(second) => {
                    *conn = None;
                    metrics.record_frame_dropped();
                    debug!(address = %address, error = %second, "transfer frame dropped");
                }
            }
        }
    }
}

async fn write_once(
    conn: &mut Option<TcpStream>,
    address: &str,
    connect_timeout: Duration,
    frame: &TransferFrame,
) -> Result<(), TransferError> {
    if conn.is_none() {
        let stream = connect(address, connect_timeout).await?;
        debug!(address = %address, "transfer connection established");
        *conn = Some(stream);
    }
    // Guaranteed set above; a failed connect already returned.
    if let Some(stream) = conn.as_mut() {
        write_frame(stream, frame).await?;
    }
    Ok(())
}

async fn connect(address: &str, timeout: Duration) -> Result<TcpStream, TransferError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| TransferError::Connection {
            address: address.to_string(),
            reason: "connect timed out".to_string(),
        })?
        .map_err(|e| TransferError::Connection {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use sluice_core::record::BincodeCodec;
    use tokio::net::TcpListener;

    fn codec() -> Arc<dyn RecordCodec> {
        Arc::new(BincodeCodec)
    }

    #[tokio::test]
    async fn test_connects_lazily_and_delivers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let metrics = Arc::new(SwitchMetrics::new());
        let sender = TransferSender::start(address, &SwitchConfig::default(), Arc::clone(&metrics));
        let forwarder = sender.forwarder(codec());

        forwarder
            .forward_flag(ControlFlag::SwitchRecord)
            .await
            .unwrap();
        forwarder
            .forward(SwitchRecord::new(3, b"three".to_vec()))
            .await
            .unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(
            read_frame(&mut stream, 1 << 20).await.unwrap(),
            Some(TransferFrame::Flag(ControlFlag::SwitchRecord))
        );
        let frame = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        let TransferFrame::Record(bytes) = frame else {
            panic!("expected a record frame");
        };
        assert_eq!(BincodeCodec.decode(&bytes).unwrap().id(), 3);

        sender.shutdown().await;
        assert_eq!(metrics.snapshot().frames_sent, 2);
    }

    #[tokio::test]
    async fn test_unreachable_receiver_drops_frames() {
        // Grab a port nothing is listening on.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = probe.local_addr().unwrap().to_string();
        drop(probe);

        let config = SwitchConfig::new().with_connect_timeout(Duration::from_millis(200));
        let metrics = Arc::new(SwitchMetrics::new());
        let sender = TransferSender::start(address, &config, Arc::clone(&metrics));
        let forwarder = sender.forwarder(codec());

        // Queueing succeeds even though nothing will arrive.
        forwarder
            .forward_flag(ControlFlag::GeneralQueue)
            .await
            .unwrap();
        forwarder
            .forward(SwitchRecord::new(1, Vec::new()))
            .await
            .unwrap();

        sender.shutdown().await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 0);
        assert_eq!(snapshot.frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_forward_after_shutdown_is_channel_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let sender = TransferSender::start(
            address,
            &SwitchConfig::default(),
            Arc::new(SwitchMetrics::new()),
        );
        let forwarder = sender.forwarder(codec());
        sender.shutdown().await;

        let err = forwarder
            .forward(SwitchRecord::new(9, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_queued_frames_flush_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let metrics = Arc::new(SwitchMetrics::new());
        let sender = TransferSender::start(address, &SwitchConfig::default(), Arc::clone(&metrics));
        let forwarder = sender.forwarder(codec());

        for id in 0..5 {
            forwarder
                .forward(SwitchRecord::new(id, Vec::new()))
                .await
                .unwrap();
        }

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = 0;
            while let Some(frame) = read_frame(&mut stream, 1 << 20).await.unwrap() {
                if matches!(frame, TransferFrame::Record(_)) {
                    seen += 1;
                }
            }
            seen
        });

        sender.shutdown().await;
        assert_eq!(accept.await.unwrap(), 5);
        assert_eq!(metrics.snapshot().frames_sent, 5);
    }
}
