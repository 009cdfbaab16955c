//! WebSocket client for the wave server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect by connecting again)
//! - Decoded server messages delivered as [`SyncEvent`]s on an mpsc channel
//! - [`ClientTransport`], the multiplexer's [`Transport`] over this connection
//!
//! The client holds no wave state. Buffering edits across a lost
//! connection is the operation channel's job, which resends after the
//! multiplexer reconnects.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tidal_core::{HashedVersion, ParticipantId, WaveId, WaveletDelta, WaveletId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::multiplexer::{Transport, TransportError};
use crate::protocol::{ClientMessage, IdFilter, KnownWavelet, ProtocolError, ServerMessage};

/// Frames buffered between the caller and the writer task.
const OUTGOING_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    /// The socket closed; feed `on_disconnected` to the view.
    Disconnected,
    Message(ServerMessage),
}

pub struct SyncClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Tells the writer task to close the socket; dropping it does too.
    shutdown_tx: Option<oneshot::Sender<()>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            shutdown_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, or reconnect after a disconnect.
    ///
    /// Spawns a writer task fed by [`Self::sender`] and a reader task that
    /// forwards decoded server messages as events.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            *state = match *state {
                ConnectionState::Disconnected if self.outgoing_tx.is_some() => {
                    ConnectionState::Reconnecting
                }
                _ => ConnectionState::Connecting,
            };
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.outgoing_tx = Some(out_tx);
        self.shutdown_tx = Some(shutdown_tx);

        // Writer task: forward outgoing channel to WebSocket
        let writer = Arc::new(Mutex::new(ws_writer));
        let write_half = writer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = out_rx.recv() => {
                        let Some(data) = data else { break };
                        let mut w = write_half.lock().await;
                        if w.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            let _ = write_half.lock().await.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to {}", self.server_url);

        // Reader task: decode incoming frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(message) => {
                            if event_tx.send(SyncEvent::Message(message)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = writer.lock().await.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the socket. Transports bound to this connection start
    /// reporting `Disconnected` once the writer task exits.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(());
        }
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = message.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// The writer channel of the current connection.
    pub fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outgoing_tx.clone()
    }

    /// A transport bound to the current connection.
    pub fn transport(&self) -> ClientTransport {
        ClientTransport {
            outgoing: self.sender(),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// [`Transport`] that queues encoded frames for a [`SyncClient`]'s writer.
///
/// Calls never block: a full queue is `QueueFull`, a gone connection is
/// `Disconnected`. After reconnecting, [`attach`](Self::attach) the new
/// connection's sender before calling `reconnect` on the view.
#[derive(Debug, Clone, Default)]
pub struct ClientTransport {
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
}

impl ClientTransport {
    pub fn new(outgoing: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            outgoing: Some(outgoing),
        }
    }

    pub fn attach(&mut self, outgoing: mpsc::Sender<Vec<u8>>) {
        self.outgoing = Some(outgoing);
    }

    pub fn is_attached(&self) -> bool {
        self.outgoing.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send(&mut self, message: ClientMessage) -> Result<(), TransportError> {
        let Some(tx) = &self.outgoing else {
            return Err(TransportError::Disconnected);
        };
        let encoded = message.encode()?;
        tx.try_send(encoded).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Disconnected,
        })
    }
}

impl Transport for ClientTransport {
    fn open_stream(
        &mut self,
        wave_id: &WaveId,
        participant: &ParticipantId,
        filter: &IdFilter,
        known: Vec<KnownWavelet>,
    ) -> Result<(), TransportError> {
        self.send(ClientMessage::Open {
            wave_id: wave_id.clone(),
            participant: participant.clone(),
            filter: filter.clone(),
            known,
        })
    }

    fn submit_delta(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
        delta: WaveletDelta,
    ) -> Result<(), TransportError> {
        self.send(ClientMessage::Submit {
            wave_id: wave_id.clone(),
            wavelet_id: wavelet_id.clone(),
            delta,
        })
    }

    fn fetch_history(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
        from: HashedVersion,
        to: HashedVersion,
    ) -> Result<(), TransportError> {
        self.send(ClientMessage::FetchHistory {
            wave_id: wave_id.clone(),
            wavelet_id: wavelet_id.clone(),
            from,
            to,
        })
    }

    fn request_snapshot(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
    ) -> Result<(), TransportError> {
        self.send(ClientMessage::RequestSnapshot {
            wave_id: wave_id.clone(),
            wavelet_id: wavelet_id.clone(),
        })
    }

    fn close(&mut self, wave_id: &WaveId) -> Result<(), TransportError> {
        self.send(ClientMessage::Close {
            wave_id: wave_id.clone(),
        })
    }
}
