//! Example comparing the cost of reusing a WebAssembly instance with creating a new one, or a new
//! execution context, for every call.

use std::time::Duration;

use invoke_bench::{Call, EngineConfig, PoolConfig, Recycle, WasmEnvironment, WorkerPool};

const ADD: &str = r#"(module (func (export "add") (param i32 i32) (result i32)
    local.get 0 local.get 1 i32.add))"#;

fn main() {
    let environment =
        WasmEnvironment::initialize(&EngineConfig::new()).expect("the default engine is valid");
    let program = environment
        .compile(ADD)
        .expect("the example program is valid");
    let call = Call::new("add", [77, 88]);

    for recycle in [
        Recycle::Never,
        Recycle::INSTANCE_PER_CALL,
        Recycle::CONTEXT_PER_CALL,
    ] {
        let config = PoolConfig::builder().recycle(recycle).build();
        let report = WorkerPool::new(&program, &call, config).run_for(Duration::from_millis(500));

        println!("{recycle}:");
        println!("{report}");
        println!();
    }
}
