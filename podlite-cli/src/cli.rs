//! CLI definition and argument parsing for podlite-cli.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use podlite::{PodliteOptions, PodliteRuntime, VmBootConfig};

#[derive(Parser, Debug)]
#[command(name = "podlite", author, version, about = "Podlite CLI")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
#[non_exhaustive]
pub enum Commands {
    /// Run a pod from a spec file
    Run(crate::commands::run::RunArgs),

    /// Stop a running pod
    Stop(crate::commands::stop::StopArgs),

    /// List running pods
    #[command(visible_alias = "ls", visible_alias = "ps")]
    List(crate::commands::list::ListArgs),
}

// ============================================================================
// GLOBAL FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Podlite home directory
    #[arg(long, global = true, env = "PODLITE_HOME")]
    pub home: Option<PathBuf>,

    /// Guest kernel image
    #[arg(long, global = true, env = "PODLITE_KERNEL")]
    pub kernel: Option<PathBuf>,

    /// Guest initrd image
    #[arg(long, global = true, env = "PODLITE_INITRD")]
    pub initrd: Option<PathBuf>,
}

impl GlobalFlags {
    pub fn create_runtime(&self) -> anyhow::Result<PodliteRuntime> {
        let mut options = PodliteOptions::default();
        if let Some(home) = &self.home {
            options.home_dir = home.clone();
        }

        let mut boot = VmBootConfig::default();
        if let Some(kernel) = &self.kernel {
            boot.kernel = kernel.clone();
        }
        if let Some(initrd) = &self.initrd {
            boot.initrd = initrd.clone();
        }
        options.boot = boot;

        PodliteRuntime::new(options).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_build_runtime() {
        let dir = std::env::temp_dir().join("podlite-cli-test");
        let flags = GlobalFlags {
            debug: false,
            home: Some(dir.clone()),
            kernel: Some(PathBuf::from("/boot/vmlinuz")),
            initrd: None,
        };

        let runtime = flags.create_runtime().unwrap();
        assert!(format!("{:?}", runtime).contains("podlite-cli-test"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
