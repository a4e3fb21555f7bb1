/*
 * lib.rs
 *
 * Crate root. The interesting invariants live in the leaf modules; this
 * just wires them together and re-exports the surface a host runtime uses.
 */

//! # faultgate
//!
//! Single-fire fatal-diagnostic capture for multithreaded native runtimes.
//!
//! When a runtime hits an assertion failure, fatal condition, or
//! out-of-memory event, two things must happen despite unbounded
//! concurrency and a trigger path that runs inside a hardware-fault
//! handler:
//!
//! - the report is enriched with the faulting thread's register state,
//!   captured race-free **exactly once** (poison page + claim-once latch);
//! - expensive termination actions (heap dump, external command, abort,
//!   exit) execute **exactly once** even when many threads hit the same
//!   condition together.
//!
//! Everything on those paths is lock-free; the only synchronization
//! primitive is an atomic compare-and-set.
//!
//! ## Quick Start
//!
//! ```rust
//! use faultgate::FireLatch;
//!
//! static HEAVY_ACTIONS: FireLatch = FireLatch::new();
//!
//! // exactly one caller wins, no matter how many race
//! assert!(HEAVY_ACTIONS.claim());
//! assert!(!HEAVY_ACTIONS.claim());
//! ```
//!
//! A host runtime installs the process-wide diagnostics object once at
//! startup and (optionally) the fault trampoline:
//!
//! ```rust,no_run
//! use faultgate::{DiagConfig, OomConfig, install, install_fault_handler};
//!
//! let config = DiagConfig {
//!     oom: OomConfig {
//!         command: Some("notify-send 'runtime OOM'".to_string()),
//!         exit: true,
//!         ..OomConfig::default()
//!     },
//!     ..DiagConfig::default()
//! };
//! let diag = install(config).expect("installed once at startup");
//! install_fault_handler().expect("sigaction");
//! let _ = diag;
//! ```

pub mod context;
pub mod diag;
pub mod error;
pub mod handler;
pub mod io;
pub mod nesting;
pub mod poison;
pub mod process;
pub mod report;
pub mod sync;

pub use context::{ContextCapture, ContextFixup, MACHINE_CONTEXT_SIZE, MachineContext, current_thread_id, platform_fixup};
pub use diag::{DiagConfig, Diagnostics, FATAL_DURING_INIT_ENV, OomConfig, install, installed};
pub use error::{DiagError, Result, errno_name, exit_codes};
pub use handler::install_fault_handler;
pub use io::{Sink, stderr_sink};
pub use nesting::{NestingCounter, ScopeGuard};
pub use poison::PoisonPageGuard;
pub use report::{ErrorKind, ErrorReport, FatalCategory, Reporter, abort_reporter};
pub use sync::{AtomicOnce, FireLatch};
