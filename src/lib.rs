//! motionlog - A motion controller firmware log analyzer written in Rust
//!
//! This library reconstructs structured artifacts from the debug log of an
//! embedded motion controller: configuration snapshots, shutdown incident
//! reports with a reconciled multi-clock timeline, and g-code scripts
//! recovered from replayed command echoes.
//!
//! ## Module Structure
//!
//! - [`analyzer`] - Single-pass line dispatcher and analysis session
//! - [`artifact`] - Output artifact types and shared section markers
//! - [`clock`] - Clock synchronization and truncated-counter reconstruction
//! - [`config_dump`] - Configuration dump capture and deduplication
//! - [`shutdown`] - Per-incident assembly and timeline merge
//! - [`streams`] - Subsystem stream parsers
//!   - `mcu` - controller unit state and send/receive queues
//!   - `motion` - stepper and trajectory queues
//!   - `gcode` - replayed command capture and state restore
//!   - `api` - command/API request queue
//!   - `stats` - periodic statistics and timestamp reconciliation
//! - [`tmc_uart`] - Embedded UART sub-protocol frame codec

pub mod analyzer;
pub mod artifact;
pub mod clock;
pub mod config_dump;
pub mod shutdown;
pub mod streams;
pub mod tmc_uart;

pub use analyzer::{analyze, analyze_with, AnalyzeOptions};
pub use artifact::{AnalyzeError, Extraction, OutputFile};
