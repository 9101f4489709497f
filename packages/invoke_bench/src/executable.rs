use std::fmt::{self, Display};
use std::num::NonZero;

use new_zealand::nz;

use crate::{Call, CallError};

/// A compiled program that workers can instantiate and call.
///
/// Implementations are shared read-only by every worker thread, hence `Sync`. Each worker
/// creates its own [`Executable::Instance`] on its own thread and never shares it, so instances
/// need not be `Send` or `Sync`.
///
/// Two variants ship with this crate: [`NativeProgram`][crate::NativeProgram] (kernels compiled
/// into the harness) and [`WasmProgram`][crate::WasmProgram] (WebAssembly run by an engine).
pub trait Executable: Sync {
    /// One execution context bound to one live instance of the program.
    type Instance;

    /// Creates a fresh, independent execution context with a new instance of the program.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::Instantiation`][crate::InvocationError::Instantiation] if the
    /// program cannot be instantiated.
    fn instantiate(&self) -> Result<Self::Instance, CallError>;

    /// Replaces the program instance inside an existing execution context, resetting program
    /// state (memory, globals) while keeping the context itself.
    ///
    /// The default implementation rebuilds the whole context.
    ///
    /// # Errors
    ///
    /// Same as [`instantiate()`][Self::instantiate].
    fn reinstantiate(&self, instance: &mut Self::Instance) -> Result<(), CallError> {
        *instance = self.instantiate()?;
        Ok(())
    }

    /// Calls the exported function named by `call` with its arguments and returns the result.
    ///
    /// # Errors
    ///
    /// Returns an [`InvocationError`][crate::InvocationError] if the export is missing or cannot
    /// be called with the supplied arguments, or an [`ExecutionFault`][crate::ExecutionFault] if
    /// the program faults while running.
    fn invoke(&self, instance: &mut Self::Instance, call: &Call) -> Result<i64, CallError>;
}

/// When a worker throws away program state and starts from a fresh instance.
///
/// Recycling happens right before the call that is due for a fresh instance, and its cost is
/// counted as part of that call. All policies produce identical results for side-effect-free
/// programs; they differ in how much setup cost each call pays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Recycle {
    /// One instance serves every call for the lifetime of the worker.
    #[default]
    Never,

    /// A new program instance is created inside the existing execution context after the given
    /// number of calls.
    Instance(NonZero<u32>),

    /// The whole execution context is rebuilt after the given number of calls.
    Context(NonZero<u32>),
}

impl Recycle {
    /// A new program instance for every call.
    pub const INSTANCE_PER_CALL: Self = Self::Instance(nz!(1));

    /// A new execution context for every call.
    pub const CONTEXT_PER_CALL: Self = Self::Context(nz!(1));

    /// Number of calls served by one instance, `None` if instances live forever.
    #[must_use]
    pub fn interval(self) -> Option<NonZero<u32>> {
        match self {
            Self::Never => None,
            Self::Instance(every) | Self::Context(every) => Some(every),
        }
    }
}

impl Display for Recycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("reuse"),
            Self::Instance(every) if every.get() == 1 => f.write_str("new instance per call"),
            Self::Instance(every) => write!(f, "new instance every {every} calls"),
            Self::Context(every) if every.get() == 1 => f.write_str("new context per call"),
            Self::Context(every) => write!(f, "new context every {every} calls"),
        }
    }
}

/// Tracks how many calls the current instance has served and recycles it when due.
#[derive(Debug)]
pub(crate) struct Recycler {
    policy: Recycle,
    calls_on_instance: u32,
}

impl Recycler {
    pub(crate) fn new(policy: Recycle) -> Self {
        Self {
            policy,
            calls_on_instance: 0,
        }
    }

    /// Prepares `instance` for the next call, recycling it first if it has served its quota.
    ///
    /// Returns whether a recycle took place.
    pub(crate) fn prepare<E>(
        &mut self,
        executable: &E,
        instance: &mut E::Instance,
    ) -> Result<bool, CallError>
    where
        E: Executable + ?Sized,
    {
        let recycled = match self.policy {
            Recycle::Never => false,
            Recycle::Instance(every) if self.calls_on_instance >= every.get() => {
                executable.reinstantiate(instance)?;
                true
            }
            Recycle::Context(every) if self.calls_on_instance >= every.get() => {
                *instance = executable.instantiate()?;
                true
            }
            Recycle::Instance(_) | Recycle::Context(_) => false,
        };

        if recycled {
            self.calls_on_instance = 0;
        }

        self.calls_on_instance = self.calls_on_instance.saturating_add(1);
        Ok(recycled)
    }
}
