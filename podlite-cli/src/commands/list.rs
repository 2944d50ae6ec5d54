//! `podlite list` - show registered pods.

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ListArgs {}

pub async fn execute(_args: ListArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;

    let pods = runtime.list_pods();
    if pods.is_empty() {
        println!("no pods");
        return Ok(());
    }

    println!("{:<24} {:<16} {}", "POD", "VM", "CREATED");
    for pod in pods {
        println!(
            "{:<24} {:<16} {}",
            pod.name,
            pod.vm_id,
            pod.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
