//! WebAssembly programs executed by the `wasmtime` engine.

use std::any::type_name;
use std::fmt;

use tracing::debug;
use wasmtime::{Config, Engine, Func, Instance, Module, Store, Val, ValType};

use crate::{Call, CallError, Executable, ExecutionFault, InvocationError, SetupError};

/// How many module instances one store may accumulate before it is replaced.
///
/// A store never frees the instances created inside it, so a context that is asked for a new
/// instance on every call must be swapped out periodically to keep memory use flat.
const STORE_RECYCLE_INTERVAL: u32 = 1_000;

/// Engine settings fixed for the lifetime of a [`WasmEnvironment`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    bounds_checks: bool,
}

impl EngineConfig {
    /// Default engine settings: memory accesses are checked with guard pages.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every memory access is checked with explicit compare-and-branch code instead of
    /// relying on virtual memory guard pages.
    #[must_use]
    pub fn with_bounds_checks(mut self, bounds_checks: bool) -> Self {
        self.bounds_checks = bounds_checks;
        self
    }

    /// Whether explicit bounds checks are enabled.
    #[must_use]
    pub fn bounds_checks(&self) -> bool {
        self.bounds_checks
    }
}

/// Owns the WebAssembly engine shared by every program and instance.
///
/// Create one environment before any worker starts and dispose of it after all workers have
/// stopped. Programs compiled by the environment borrow it, so the compiler rejects any attempt
/// to dispose of the environment while a program (and thus an instance) is still alive.
///
/// # Example
///
/// ```
/// use invoke_bench::{Call, EngineConfig, Executable, WasmEnvironment};
///
/// let environment = WasmEnvironment::initialize(&EngineConfig::new())?;
/// let program = environment.compile(
///     r#"(module (func (export "add") (param i32 i32) (result i32)
///            local.get 0 local.get 1 i32.add))"#,
/// )?;
///
/// let mut instance = program.instantiate()?;
/// assert_eq!(program.invoke(&mut instance, &Call::new("add", [77, 88]))?, 165);
///
/// drop(instance);
/// drop(program);
/// environment.dispose();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct WasmEnvironment {
    engine: Engine,
    config: EngineConfig,
}

impl WasmEnvironment {
    /// Performs the one-time engine setup.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Initialization`] if the engine rejects the configuration.
    pub fn initialize(config: &EngineConfig) -> Result<Self, SetupError> {
        let mut engine_config = Config::new();

        if config.bounds_checks {
            // Without a reservation every linear memory is a plain allocation, so the compiled
            // code has to check each access itself.
            engine_config.memory_reservation(0);
            engine_config.memory_guard_size(0);
        }

        let engine = Engine::new(&engine_config).map_err(|error| SetupError::Initialization {
            message: format!("{error:#}"),
        })?;

        debug!(bounds_checks = config.bounds_checks, "execution engine initialized");

        Ok(Self {
            engine,
            config: *config,
        })
    }

    /// Settings the environment was initialized with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and compiles a program given as binary WebAssembly or WAT text.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Compilation`] if the bytes are not a valid module.
    pub fn compile(&self, bytes: impl AsRef<[u8]>) -> Result<WasmProgram<'_>, SetupError> {
        let module =
            Module::new(&self.engine, bytes.as_ref()).map_err(|error| SetupError::Compilation {
                message: format!("{error:#}"),
            })?;

        debug!(exports = module.exports().len(), "program compiled");

        Ok(WasmProgram {
            environment: self,
            module,
        })
    }

    /// Releases the engine. Only possible once every program compiled by it is gone.
    #[cfg_attr(test, mutants::skip)] // Dropping is all there is to it.
    pub fn dispose(self) {
        debug!("execution engine disposed");
        drop(self);
    }
}

impl fmt::Debug for WasmEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A compiled WebAssembly module, shareable by every worker.
pub struct WasmProgram<'env> {
    environment: &'env WasmEnvironment,
    module: Module,
}

impl fmt::Debug for WasmProgram<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("environment", self.environment)
            .finish_non_exhaustive()
    }
}

impl WasmProgram<'_> {
    fn new_store(&self) -> Store<()> {
        Store::new(&self.environment.engine, ())
    }

    fn new_instance(&self, store: &mut Store<()>) -> Result<Instance, CallError> {
        Instance::new(store, &self.module, &[]).map_err(|error| {
            InvocationError::Instantiation {
                message: format!("{error:#}"),
            }
            .into()
        })
    }

    /// Looks up `function` and checks that its signature only carries integers.
    fn resolve(
        store: &mut Store<()>,
        instance: Instance,
        function: &str,
    ) -> Result<Resolved, CallError> {
        let func = instance
            .get_func(&mut *store, function)
            .ok_or_else(|| InvocationError::MissingExport {
                function: function.to_string(),
            })?;

        let ty = func.ty(&*store);

        let params: Vec<ParamKind> = ty
            .params()
            .map(|param| ParamKind::of(&param, function))
            .collect::<Result<_, _>>()?;

        let results: Vec<ValType> = ty.results().collect();
        let [result] = results.as_slice() else {
            return Err(InvocationError::UnsupportedSignature {
                function: function.to_string(),
                detail: format!("expected exactly one result, found {}", results.len()),
            }
            .into());
        };
        let result = ParamKind::of(result, function)?;

        Ok(Resolved {
            function: function.into(),
            func,
            args: Vec::with_capacity(params.len()),
            params,
            result,
        })
    }
}

impl Executable for WasmProgram<'_> {
    type Instance = WasmInstance;

    fn instantiate(&self) -> Result<WasmInstance, CallError> {
        let mut store = self.new_store();
        let instance = self.new_instance(&mut store)?;

        Ok(WasmInstance {
            store,
            instance,
            instances_in_store: 1,
            resolved: None,
        })
    }

    fn reinstantiate(&self, instance: &mut WasmInstance) -> Result<(), CallError> {
        if instance.instances_in_store >= STORE_RECYCLE_INTERVAL {
            *instance = self.instantiate()?;
            return Ok(());
        }

        instance.instance = self.new_instance(&mut instance.store)?;
        instance.instances_in_store = instance.instances_in_store.saturating_add(1);
        instance.resolved = None;
        Ok(())
    }

    fn invoke(&self, instance: &mut WasmInstance, call: &Call) -> Result<i64, CallError> {
        let resolved = match instance.resolved.take() {
            Some(resolved) if *resolved.function == *call.function() => {
                instance.resolved.insert(resolved)
            }
            _ => instance.resolved.insert(Self::resolve(
                &mut instance.store,
                instance.instance,
                call.function(),
            )?),
        };

        resolved.bind(call)?;

        let mut results = [resolved.result.zero()];

        resolved
            .func
            .call(&mut instance.store, &resolved.args, &mut results)
            .map_err(|error| ExecutionFault::new(format!("{error:#}")))?;

        match results {
            [Val::I32(value)] => Ok(i64::from(value)),
            [Val::I64(value)] => Ok(value),
            _ => Err(ExecutionFault::new("program returned a non-integer result").into()),
        }
    }
}

/// Execution context of a [`WasmProgram`]: a store holding the current module instance.
pub struct WasmInstance {
    store: Store<()>,
    instance: Instance,
    instances_in_store: u32,

    // Export lookup for the most recently called function, valid until the module instance is
    // replaced.
    resolved: Option<Resolved>,
}

impl fmt::Debug for WasmInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("instances_in_store", &self.instances_in_store)
            .field(
                "resolved",
                &self.resolved.as_ref().map(|resolved| &resolved.function),
            )
            .finish_non_exhaustive()
    }
}

struct Resolved {
    function: Box<str>,
    func: Func,
    params: Vec<ParamKind>,
    result: ParamKind,

    // Arguments of the current call, converted to the parameter types.
    args: Vec<Val>,
}

impl Resolved {
    fn bind(&mut self, call: &Call) -> Result<(), InvocationError> {
        let args = call.args();

        if self.params.len() != args.len() {
            return Err(InvocationError::ArityMismatch {
                function: self.function.to_string(),
                expected: self.params.len(),
                actual: args.len(),
            });
        }

        self.args.clear();

        for (index, (kind, &value)) in self.params.iter().zip(args).enumerate() {
            let Some(converted) = kind.to_val(value) else {
                return Err(InvocationError::ArgumentOutOfRange {
                    function: self.function.to_string(),
                    index,
                    value,
                });
            };

            self.args.push(converted);
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParamKind {
    I32,
    I64,
}

impl ParamKind {
    fn of(ty: &ValType, function: &str) -> Result<Self, InvocationError> {
        match ty {
            ValType::I32 => Ok(Self::I32),
            ValType::I64 => Ok(Self::I64),
            other => Err(InvocationError::UnsupportedSignature {
                function: function.to_string(),
                detail: format!("only i32 and i64 values are supported, found {other}"),
            }),
        }
    }

    fn to_val(self, value: i64) -> Option<Val> {
        match self {
            Self::I32 => i32::try_from(value).ok().map(Val::I32),
            Self::I64 => Some(Val::I64(value)),
        }
    }

    fn zero(self) -> Val {
        match self {
            Self::I32 => Val::I32(0),
            Self::I64 => Val::I64(0),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(WasmEnvironment: Send, Sync);
    assert_impl_all!(WasmProgram<'static>: Send, Sync);

    const ADD: &str = r#"(module (func (export "add") (param i32 i32) (result i32)
        local.get 0 local.get 1 i32.add))"#;

    const ADD64: &str = r#"(module (func (export "add64") (param i64 i64) (result i64)
        local.get 0 local.get 1 i64.add))"#;

    const BUMP: &str = r#"(module
        (global $n (mut i32) (i32.const 0))
        (func (export "bump") (result i32)
            global.get $n i32.const 1 i32.add global.set $n global.get $n))"#;

    const OOB: &str = r#"(module (memory 1)
        (func (export "oob") (result i32) i32.const 65536 i32.load))"#;

    const NO_RESULT: &str = r#"(module (func (export "nothing")))"#;

    fn environment(bounds_checks: bool) -> WasmEnvironment {
        WasmEnvironment::initialize(&EngineConfig::new().with_bounds_checks(bounds_checks))
            .unwrap()
    }

    #[test]
    fn add_returns_sum_with_and_without_bounds_checks() {
        for bounds_checks in [false, true] {
            let environment = environment(bounds_checks);
            let program = environment.compile(ADD).unwrap();
            let mut instance = program.instantiate().unwrap();

            let result = program.invoke(&mut instance, &Call::new("add", [77, 88]));
            assert_eq!(result.unwrap(), 165);
        }
    }

    #[test]
    fn i64_signatures_are_supported() {
        let environment = environment(false);
        let program = environment.compile(ADD64).unwrap();
        let mut instance = program.instantiate().unwrap();

        let big = i64::from(i32::MAX) * 4;
        let result = program.invoke(&mut instance, &Call::new("add64", [big, 1]));
        assert_eq!(result.unwrap(), big + 1);
    }

    #[test]
    fn invalid_program_is_a_setup_error() {
        let environment = environment(false);
        let error = environment.compile("(module (func (export").unwrap_err();
        assert!(matches!(error, SetupError::Compilation { .. }));
    }

    #[test]
    fn reinstantiate_resets_globals() {
        let environment = environment(false);
        let program = environment.compile(BUMP).unwrap();
        let bump = Call::new("bump", []);
        let mut instance = program.instantiate().unwrap();

        assert_eq!(program.invoke(&mut instance, &bump).unwrap(), 1);
        assert_eq!(program.invoke(&mut instance, &bump).unwrap(), 2);

        program.reinstantiate(&mut instance).unwrap();
        assert_eq!(program.invoke(&mut instance, &bump).unwrap(), 1);
    }

    #[test]
    fn store_is_replaced_after_many_instances() {
        let environment = environment(false);
        let program = environment.compile(BUMP).unwrap();
        let mut instance = program.instantiate().unwrap();

        for _ in 0..STORE_RECYCLE_INTERVAL {
            program.reinstantiate(&mut instance).unwrap();
        }

        assert_eq!(instance.instances_in_store, 1);
    }

    #[test]
    fn out_of_bounds_access_is_a_fault() {
        let environment = environment(true);
        let program = environment.compile(OOB).unwrap();
        let mut instance = program.instantiate().unwrap();

        let error = program
            .invoke(&mut instance, &Call::new("oob", []))
            .unwrap_err();
        assert!(error.is_fault());

        // The instance stays usable after a trap.
        let error = program
            .invoke(&mut instance, &Call::new("oob", []))
            .unwrap_err();
        assert!(error.is_fault());
    }

    #[test]
    fn missing_export_is_an_invocation_error() {
        let environment = environment(false);
        let program = environment.compile(ADD).unwrap();
        let mut instance = program.instantiate().unwrap();

        let error = program
            .invoke(&mut instance, &Call::new("mul", [1, 2]))
            .unwrap_err();

        assert_eq!(
            error,
            CallError::Invocation(InvocationError::MissingExport {
                function: "mul".to_string()
            })
        );
    }

    #[test]
    fn arity_and_range_are_checked() {
        let environment = environment(false);
        let program = environment.compile(ADD).unwrap();
        let mut instance = program.instantiate().unwrap();

        let error = program
            .invoke(&mut instance, &Call::new("add", [1]))
            .unwrap_err();
        assert!(matches!(
            error,
            CallError::Invocation(InvocationError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));

        let error = program
            .invoke(&mut instance, &Call::new("add", [1, i64::MAX]))
            .unwrap_err();
        assert!(matches!(
            error,
            CallError::Invocation(InvocationError::ArgumentOutOfRange { index: 1, .. })
        ));
    }

    #[test]
    fn every_call_uses_its_own_arguments() {
        let environment = environment(false);
        let program = environment.compile(ADD).unwrap();
        let mut instance = program.instantiate().unwrap();

        assert_eq!(
            program
                .invoke(&mut instance, &Call::new("add", [77, 88]))
                .unwrap(),
            165
        );
        assert_eq!(
            program.invoke(&mut instance, &Call::new("add", [1, 1])).unwrap(),
            2
        );

        let error = program
            .invoke(&mut instance, &Call::new("add", [1]))
            .unwrap_err();
        assert!(matches!(
            error,
            CallError::Invocation(InvocationError::ArityMismatch { .. })
        ));

        // A failed call leaves the instance usable for well-formed ones.
        assert_eq!(
            program.invoke(&mut instance, &Call::new("add", [2, 3])).unwrap(),
            5
        );
    }

    #[test]
    fn function_without_result_is_unsupported() {
        let environment = environment(false);
        let program = environment.compile(NO_RESULT).unwrap();
        let mut instance = program.instantiate().unwrap();

        let error = program
            .invoke(&mut instance, &Call::new("nothing", []))
            .unwrap_err();
        assert!(matches!(
            error,
            CallError::Invocation(InvocationError::UnsupportedSignature { .. })
        ));
    }
}
