//! `podlite run` - submit a pod spec and wait for the pod to come up.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pod spec (JSON)
    pub spec: PathBuf,
}

pub async fn execute(args: RunArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let spec_bytes = std::fs::read(&args.spec)
        .with_context(|| format!("failed to read spec {}", args.spec.display()))?;

    let runtime = global.create_runtime()?;
    let response = runtime.run_pod(&spec_bytes).await?;

    println!("ID: {}", response.vm_id);
    println!("Code: {}", response.code);
    if !response.cause.is_empty() {
        println!("Cause: {}", response.cause);
    }
    Ok(())
}
