//! # tidal-collab — Client and server plumbing for collaborative waves
//!
//! Keeps local replicas of wavelets in step with an authoritative server
//! while the user keeps typing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────── client ───────────────────────────┐
//! │ editor ──▶ WaveView ──▶ OperationMultiplexer ──▶ Transport ──┼──┐
//! │   ▲          │ undo         │ one OperationChannel           │  │
//! │   └──────────┘ per doc      │ per wavelet                    │  │ WebSocket
//! └──────────────────────────────────────────────────────────────┘  │ bincode
//!                                                                   │
//! ┌─────────────────────────── server ───────────────────────────┐  │
//! │ SyncServer ──▶ WaveRoom ──▶ WaveletContainer ──▶ DeltaHistory│◀─┘
//! │                   └──────▶ BroadcastGroup (fan-out)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded client/server messages)
//! - [`channel`] — Per-wavelet client state machine: in-flight, pending, transform
//! - [`multiplexer`] — All channels of one wave over one transport
//! - [`view`] — Wave view façade: local documents, undo, listeners
//! - [`client`] — WebSocket client and its [`Transport`](multiplexer::Transport)
//! - [`container`] — Authoritative wavelet state on the server
//! - [`room`] / [`broadcast`] — Per-wave rooms and fan-out
//! - [`server`] — Reference WebSocket wave server
//! - [`storage`] — LZ4-compressed delta history
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Frame encode (typing delta) | <2µs |
//! | Broadcast 1K frames × 100 peers | <10ms |
//! | Channel rebase of 100 pending ops | <1ms |

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod container;
pub mod multiplexer;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod view;

// Re-exports for convenience
pub use broadcast::{Broadcast, BroadcastGroup, BroadcastStats, Subscriber};
pub use channel::{ChannelError, Divergence, NackAction, OperationChannel, RemoteOperation};
pub use client::{ClientTransport, ConnectionState, SyncClient, SyncEvent};
pub use container::{SubmitAck, SubmitPolicy, Submitted, WaveletContainer};
pub use multiplexer::{
    CloseMode, MultiplexerConfig, MuxError, MuxEvent, MuxState, OperationMultiplexer, Transport,
    TransportError,
};
pub use protocol::{
    ClientMessage, IdFilter, KnownWavelet, ProtocolError, ServerMessage, SubmitRejection,
    SubmitResult,
};
pub use room::{RoomManager, WaveRoom};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{CompressedDelta, DeltaHistory, HistoryError, HistoryStats};
pub use view::{RemoteOperationListener, ViewError, WaveView, WaveViewListener};
