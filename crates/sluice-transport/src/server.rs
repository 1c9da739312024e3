//! Inbound side of the record transfer channel.
//!
//! [`TransferServer`] accepts connections from replaying instances and
//! feeds decoded records into a [`ReceiverSink`]. Control-flag frames
//! switch the connection's interpretation mode: what kind of record
//! subsequent frames carry, and which buffer they are destined for.
//! Every connection starts out expecting switch records bound for the
//! general queue.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use sluice_core::record::ControlFlag;
use sluice_core::{RecordCodec, SwitchConfig, SwitchRecord, TransferError};

use crate::frame::{read_frame, TransferFrame};

/// Which buffer a received record is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTarget {
    /// The staging buffer for replayed records that must precede the
    /// already-buffered input.
    Temporary,
    /// The general input queue.
    General,
}

/// Consumer of records arriving over the transfer channel.
#[async_trait]
pub trait ReceiverSink: Send + Sync {
    /// A decoded switch record arrived.
    async fn on_switch_record(&self, record: SwitchRecord, target: QueueTarget);

    /// A raw engine payload arrived.
    async fn on_general_record(&self, payload: Vec<u8>, target: QueueTarget);
}

/// What kind of record subsequent frames on a connection carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Switch,
    General,
}

/// Listening side of the transfer channel.
pub struct TransferServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TransferServer {
    /// Binds `bind_address` and starts accepting transfer connections.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Bind`] if the listener cannot be bound.
    pub async fn start(
        bind_address: &str,
        config: &SwitchConfig,
        codec: Arc<dyn RecordCodec>,
        sink: Arc<dyn ReceiverSink>,
    ) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| TransferError::Bind(format!("{bind_address}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransferError::Bind(e.to_string()))?;
        let cancel = CancellationToken::new();
        let join = tokio::spawn(accept_loop(
            listener,
            config.max_frame_bytes,
            codec,
            sink,
            cancel.clone(),
        ));
        info!(addr = %local_addr, "transfer server listening");
        Ok(Self {
            local_addr,
            cancel,
            join,
        })
    }

    /// The bound address, with any ephemeral port resolved.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and tears down connection handlers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if self.join.await.is_err() {
            warn!("transfer server task panicked");
        }
    }
}

impl std::fmt::Debug for TransferServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    max_frame_bytes: usize,
    codec: Arc<dyn RecordCodec>,
    sink: Arc<dyn ReceiverSink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("transfer server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(addr = %addr, "transfer connection accepted");
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        max_frame_bytes,
                        Arc::clone(&codec),
                        Arc::clone(&sink),
                        cancel.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "transfer accept error"),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    max_frame_bytes: usize,
    codec: Arc<dyn RecordCodec>,
    sink: Arc<dyn ReceiverSink>,
    cancel: CancellationToken,
) {
    let mut kind = RecordKind::Switch;
    let mut target = QueueTarget::General;

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = read_frame(&mut stream, max_frame_bytes) => frame,
        };
        match frame {
            Ok(Some(TransferFrame::Record(bytes))) => match kind {
                RecordKind::Switch => match codec.decode(&bytes) {
                    Ok(record) => sink.on_switch_record(record, target).await,
                    Err(e) => warn!(addr = %addr, error = %e, "undecodable transfer record"),
                },
                RecordKind::General => sink.on_general_record(bytes, target).await,
            },
            Ok(Some(TransferFrame::Flag(flag))) => {
                match flag {
                    ControlFlag::SwitchRecord => kind = RecordKind::Switch,
                    ControlFlag::GeneralRecord => kind = RecordKind::General,
                    ControlFlag::TemporaryQueue => target = QueueTarget::Temporary,
                    ControlFlag::GeneralQueue => target = QueueTarget::General,
                }
                debug!(addr = %addr, %flag, "transfer mode changed");
            }
            Ok(Some(TransferFrame::Empty)) => {
                trace!(addr = %addr, "empty transfer frame skipped");
            }
            Ok(None) => {
                debug!(addr = %addr, "transfer connection closed");
                break;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "transfer read error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::frame::write_frame;
    use sluice_core::record::BincodeCodec;

    #[derive(Debug, PartialEq, Eq)]
    enum Received {
        Switch(u64, QueueTarget),
        General(Vec<u8>, QueueTarget),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Received>>,
    }

    #[async_trait]
    impl ReceiverSink for RecordingSink {
        async fn on_switch_record(&self, record: SwitchRecord, target: QueueTarget) {
            self.events.lock().push(Received::Switch(record.id(), target));
        }

        async fn on_general_record(&self, payload: Vec<u8>, target: QueueTarget) {
            self.events.lock().push(Received::General(payload, target));
        }
    }

    async fn wait_for_events(sink: &RecordingSink, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if sink.events.lock().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sink events");
    }

    async fn start_server(sink: Arc<RecordingSink>) -> TransferServer {
        TransferServer::start(
            "127.0.0.1:0",
            &SwitchConfig::default(),
            Arc::new(BincodeCodec),
            sink,
        )
        .await
        .unwrap()
    }

    fn encoded(id: u64) -> Vec<u8> {
        BincodeCodec
            .encode(&SwitchRecord::new(id, id.to_be_bytes().to_vec()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_defaults_to_switch_records_for_general_queue() {
        let sink = Arc::new(RecordingSink::default());
        let server = start_server(Arc::clone(&sink)).await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut stream, &TransferFrame::Record(encoded(42)))
            .await
            .unwrap();

        wait_for_events(&sink, 1).await;
        assert_eq!(
            *sink.events.lock(),
            vec![Received::Switch(42, QueueTarget::General)]
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_flags_steer_interpretation() {
        let sink = Arc::new(RecordingSink::default());
        let server = start_server(Arc::clone(&sink)).await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut stream, &TransferFrame::Flag(ControlFlag::TemporaryQueue))
            .await
            .unwrap();
        write_frame(&mut stream, &TransferFrame::Record(encoded(1)))
            .await
            .unwrap();
        write_frame(&mut stream, &TransferFrame::Flag(ControlFlag::GeneralRecord))
            .await
            .unwrap();
        write_frame(&mut stream, &TransferFrame::Flag(ControlFlag::GeneralQueue))
            .await
            .unwrap();
        write_frame(&mut stream, &TransferFrame::Record(b"raw".to_vec()))
            .await
            .unwrap();

        wait_for_events(&sink, 2).await;
        assert_eq!(
            *sink.events.lock(),
            vec![
                Received::Switch(1, QueueTarget::Temporary),
                Received::General(b"raw".to_vec(), QueueTarget::General),
            ]
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_frames_are_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let server = start_server(Arc::clone(&sink)).await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut stream, &TransferFrame::Empty).await.unwrap();
        write_frame(&mut stream, &TransferFrame::Record(encoded(7)))
            .await
            .unwrap();

        wait_for_events(&sink, 1).await;
        assert_eq!(
            *sink.events.lock(),
            vec![Received::Switch(7, QueueTarget::General)]
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_undecodable_record_does_not_kill_connection() {
        let sink = Arc::new(RecordingSink::default());
        let server = start_server(Arc::clone(&sink)).await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut stream, &TransferFrame::Record(vec![0xff; 3]))
            .await
            .unwrap();
        write_frame(&mut stream, &TransferFrame::Record(encoded(8)))
            .await
            .unwrap();

        wait_for_events(&sink, 1).await;
        assert_eq!(
            *sink.events.lock(),
            vec![Received::Switch(8, QueueTarget::General)]
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_connections() {
        let sink = Arc::new(RecordingSink::default());
        let server = start_server(Arc::clone(&sink)).await;
        let addr = server.local_addr();

        let mut handles = Vec::new();
        for id in 0..4u64 {
            handles.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                write_frame(&mut stream, &TransferFrame::Record(encoded(id)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        wait_for_events(&sink, 4).await;
        let mut ids: Vec<u64> = sink
            .events
            .lock()
            .iter()
            .map(|e| match e {
                Received::Switch(id, _) => *id,
                Received::General(..) => panic!("unexpected general record"),
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        server.shutdown().await;
    }
}
