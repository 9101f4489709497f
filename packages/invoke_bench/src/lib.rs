#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Measures the throughput and tail latency of calling a compiled program from many threads.
//!
//! A [`WorkerPool`] runs one worker per thread. Each worker owns a private instance of an
//! [`Executable`] and calls one exported function over and over, either as fast as it can
//! ([`LoadMode::Saturating`]) or as requests arrive from a generator that paces them according to
//! an arrival process ([`LoadMode::Paced`]). When the pool stops, the per-worker results are
//! merged into a [`Report`] with counts, throughput and latency percentiles.
//!
//! # Quick start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use invoke_bench::{ArrivalModel, Call, LoadMode, NativeProgram, PoolConfig, WorkerPool};
//! use new_zealand::nz;
//!
//! let program = NativeProgram::new();
//! let call = Call::new("add", [77, 88]);
//!
//! let config = PoolConfig::builder()
//!     .threads(nz!(2))
//!     .load(LoadMode::paced(500.0, ArrivalModel::Exponential)?)
//!     .record_latency(true)
//!     .build();
//!
//! let report = WorkerPool::new(&program, &call, config).run_for(Duration::from_millis(50));
//!
//! assert_eq!(
//!     report.generated(),
//!     report.processed() + report.failed() + report.rejected() + report.unprocessed()
//! );
//! println!("{report}");
//! # Ok::<(), invoke_bench::ConfigurationError>(())
//! ```
//!
//! # Executables
//!
//! - [`NativeProgram`] runs kernels compiled into the harness. It measures the harness itself.
//! - [`WasmProgram`] runs a WebAssembly module on `wasmtime`. It is compiled by a
//!   [`WasmEnvironment`], which must outlive it.
//!
//! Either can recycle its instances at a configurable [`Recycle`] interval, to measure the cost
//! of isolating calls from each other.
//!
//! # Failures
//!
//! A call that cannot be made at all (missing export, wrong arity) ends the run and is reported
//! as an [`Abort`]. A call that faults inside the program is counted as failed and the run
//! continues, unless [`FaultPolicy::Abort`] is configured.

mod arrivals;
mod cli;
mod config;
mod error;
mod executable;
mod generator;
mod metrics;
mod native;
mod pool;
mod queue;
mod report;
mod request;
mod wait;
mod wasm;
mod worker;

pub use arrivals::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use executable::*;
pub use native::*;
pub use pool::*;
pub use queue::*;
pub use report::*;
pub use request::*;
pub use wait::*;
pub use wasm::*;
