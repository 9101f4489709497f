//! Example measuring response time under open-loop load at increasing request rates.
//!
//! As the rate approaches what the workers can serve, queueing makes the response time tail
//! grow much faster than the service time.

use std::time::Duration;

use invoke_bench::{ArrivalModel, Call, LoadMode, NativeProgram, PoolConfig, WorkerPool};
use new_zealand::nz;

fn main() {
    let program = NativeProgram::with_memory();
    let call = Call::new("add_mem", [77, 88]);

    for rate in [1_000.0, 10_000.0, 100_000.0] {
        let load = LoadMode::paced(rate, ArrivalModel::Exponential)
            .expect("the example rates are finite and positive");

        let config = PoolConfig::builder()
            .threads(nz!(2))
            .load(load)
            .record_latency(true)
            .build();

        let report = WorkerPool::new(&program, &call, config).run_for(Duration::from_millis(500));

        println!("{report}");
        println!();
    }
}
