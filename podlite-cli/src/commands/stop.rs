//! `podlite stop` - stop a running pod and wait for full teardown.

use anyhow::Context;
use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Pod name
    pub pod: String,
}

pub async fn execute(args: StopArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let response = runtime
        .stop_pod(&args.pod)
        .await
        .with_context(|| format!("failed to stop pod '{}'", args.pod))?;

    println!("ID: {}", args.pod);
    println!("Code: {}", response.code);
    if !response.cause.is_empty() {
        println!("Cause: {}", response.cause);
    }
    Ok(())
}
