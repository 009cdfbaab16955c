//! In-memory storage for applied wavelet history.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐   applied deltas   ┌──────────────┐
//! │ WaveletContainer│ ─────────────────► │ DeltaHistory │
//! │ (current state) │                    │ (LZ4 records)│
//! └────────┬────────┘                    └──────┬───────┘
//!          │ snapshot                           │ deltas_since / between
//!          ▼                                    ▼
//!   Open without known version        catch-up, FetchHistory, transform
//! ```
//!
//! ## Performance Targets
//!
//! | Metric                    | Target  |
//! |---------------------------|---------|
//! | Append (typing delta)     | <10μs   |
//! | Catch-up of 100 deltas    | <200μs  |

pub mod history;

pub use history::{CompressedDelta, DeltaHistory, HistoryError, HistoryStats};
