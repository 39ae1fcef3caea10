//! Clean-design baseline: the frozen model and its persistence.
//!
//! ## Architecture
//!
//! ```text
//!   ConvergenceTracker (Converged) ──► BaselineModel ──► BaselineRecord
//!                                          ▲                  │
//!                                          └── from_record ◄──┤
//!                                                             ▼
//!                                              BaselineStore (JSON file / memory)
//! ```

pub mod model;
pub mod persistence;

pub use model::{BaselineModel, BaselineRecord, SignalBaseline};
pub use persistence::{BaselineStore, InMemoryBaseline, JsonFileBaseline};
