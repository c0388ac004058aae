//! # kiroku
//!
//! Run one command, keep its output.
//!
//! The child's stdout and stderr are decoded incrementally, mirrored to the
//! console and appended to a dated log file that is rotated by age and size
//! before each run. Backspaces in the output retract what was already
//! written, so progress bars end up as their final state in the log. The
//! run can be paused, resumed and aborted from outside; once it ends, every
//! [`Notifier`] hears about the outcome.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use kiroku::{CommandSpec, LogRotationPolicy, RunConfig, RunSupervisor};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut config = RunConfig::new(CommandSpec::new(["backup.sh --full"]));
//! config.log = Some(LogRotationPolicy {
//!     pattern: "/var/log/jobs/{name}-{daily}.log".into(),
//!     days_to_keep: 30,
//!     max_total_size_kb: 50_000,
//! });
//!
//! let report = RunSupervisor::new(config, Vec::new()).run().await.unwrap();
//! println!("{:?}", report.outcome);
//! # }
//! ```

pub mod decoder;
pub mod notify;
pub mod outcome;
pub mod process;
pub mod rotation;
pub mod run;
pub mod sink;
pub mod suspend;

pub use decoder::Utf8StreamDecoder;
pub use notify::{Notifier, NotifyError};
pub use outcome::{AbortReason, ExitCodeRanges, Outcome, PausedInterval, RunRecord, SuccessPolicy};
pub use process::{ChildSupervisor, CommandSpec, ExitInfo, PauseFor, ProcessError};
pub use rotation::{LogRotationPolicy, RotationReport};
pub use run::{RunConfig, RunControl, RunError, RunReport, RunSupervisor};
pub use sink::{LogSink, Mirror, NullMirror, SinkError, StdoutMirror};
