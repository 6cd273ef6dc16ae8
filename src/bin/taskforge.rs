//! Host binary: parse options, install logging, build the batch and run
//! it to completion. Exits 0 on a clean run, 1 on a startup failure or
//! an uncaught batch error.

use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use taskforge::host::{self, Host, HostOptions};
use tracing::{error, info};

fn main() -> ExitCode {
    let options = HostOptions::parse();

    if let Err(e) = host::init_logging(&options.log_config) {
        eprintln!("cannot start program: {e}");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("taskforge-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start runtime: {e}");
            return ExitCode::from(1);
        },
    };

    match runtime.block_on(run(&options)) {
        Ok(rc) => {
            info!("exit code: {rc}");
            ExitCode::from(u8::try_from(rc).unwrap_or(1))
        },
        Err(e) => {
            error!("batch execution error: {e:#}");
            ExitCode::from(1)
        },
    }
}

async fn run(options: &HostOptions) -> anyhow::Result<i32> {
    let batch = Host::build(options)
        .await
        .context("cannot start program, abnormal termination")?;
    batch.execute().await.context("batch execution failed")
}
