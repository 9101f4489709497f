use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The execution environment could not be prepared. Always fatal: nothing is measured.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SetupError {
    /// The engine refused the requested configuration.
    #[error("failed to initialize the execution engine: {message}")]
    Initialization {
        /// Engine-provided description of the problem.
        message: String,
    },

    /// The program bytes are not a valid program for the engine.
    #[error("failed to compile program: {message}")]
    Compilation {
        /// Engine-provided description of the problem.
        message: String,
    },

    /// The program file could not be read.
    #[error("failed to read program file '{}'", path.display())]
    ReadProgram {
        /// The path that was being read.
        path: PathBuf,

        /// The underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

/// The requested combination of settings cannot be executed.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// The selected runner mode executes a program file but none was given.
    #[error("runner mode '{mode}' requires a program file (--program)")]
    MissingProgram {
        /// The runner mode that needs the program.
        mode: String,
    },

    /// Paced load needs a finite, positive arrival rate.
    #[error("request rate must be a finite number greater than zero, got {rate}")]
    InvalidRate {
        /// The rejected rate, in requests per second.
        rate: f64,
    },

    /// A thread count of zero was requested.
    #[error("at least one worker thread is required")]
    NoThreads,

    /// A bounded queue must be able to hold at least one request.
    #[error("queue capacity must be greater than zero")]
    ZeroQueueCapacity,

    /// Recycling every zero calls is meaningless.
    #[error("the recycle interval must be greater than zero")]
    ZeroRecycleInterval,

    /// A latency sample cap of zero would make latency recording meaningless.
    #[error("the per-worker latency sample cap must be greater than zero")]
    ZeroSampleCap,

    /// The value of an option could not be understood.
    #[error("invalid value '{value}' for {option}: expected one of {expected}")]
    InvalidChoice {
        /// The option being parsed.
        option: &'static str,

        /// The rejected value.
        value: String,

        /// Human-readable list of accepted values.
        expected: &'static str,
    },
}

/// The harness and the program disagree about how the program is called.
///
/// Always fatal to a run: retrying the same call can never succeed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvocationError {
    /// No export with the requested name exists.
    #[error("function '{function}' is not exported by the program")]
    MissingExport {
        /// The requested export.
        function: String,
    },

    /// The export takes a different number of arguments than were supplied.
    #[error("function '{function}' takes {expected} arguments but {actual} were supplied")]
    ArityMismatch {
        /// The called export.
        function: String,

        /// Number of parameters the export declares.
        expected: usize,

        /// Number of arguments in the call descriptor.
        actual: usize,
    },

    /// The export cannot be called with integer arguments or does not return one integer.
    #[error("function '{function}' has an unsupported signature: {detail}")]
    UnsupportedSignature {
        /// The called export.
        function: String,

        /// What about the signature is unsupported.
        detail: String,
    },

    /// An argument does not fit the parameter type of the export.
    #[error("argument {index} ({value}) of function '{function}' does not fit a 32-bit parameter")]
    ArgumentOutOfRange {
        /// The called export.
        function: String,

        /// Zero-based position of the argument.
        index: usize,

        /// The offending value.
        value: i64,
    },

    /// A fresh instance of the program could not be created.
    #[error("failed to instantiate program: {message}")]
    Instantiation {
        /// Engine-provided description of the problem.
        message: String,
    },
}

/// The program itself faulted while running, e.g. an out-of-bounds memory access.
///
/// Faults are contained: they never bring down the process.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("program faulted: {message}")]
pub struct ExecutionFault {
    message: String,
}

impl ExecutionFault {
    /// Creates a fault with a human-readable description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Description of what went wrong inside the program.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure of a single call into an executable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallError {
    /// See [`InvocationError`].
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// See [`ExecutionFault`].
    #[error(transparent)]
    Fault(#[from] ExecutionFault),
}

impl CallError {
    /// Whether this is a fault raised by the program rather than a harness/program mismatch.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}
