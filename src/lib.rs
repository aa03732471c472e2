//! Experimentation and conversion analytics engine.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Identity   │────►│  Assignment  │────►│   Recorder   │
//! │  (session)   │     │ (hash gates) │     │ (append log) │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                                                  │
//!        ┌──────────────┐                          ▼
//!        │  UI events   │──── instrument ───► ┌──────────────┐
//!        └──────────────┘                     │  Aggregator  │
//!                                             │ Significance │
//!                                             └──────────────┘
//! ```
//!
//! Everything hangs off [`engine::Engine`], an explicit context object built once at
//! startup. Storage, downstream reporting and the UI event source are traits so the
//! engine stays agnostic of where it runs.

pub mod aggregate;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod experiment;
pub mod funnel;
pub mod hashing;
pub mod identity;
pub mod instrument;
pub mod logging;
pub mod selector;
pub mod significance;
pub mod sink;
pub mod store;

pub use engine::Engine;
