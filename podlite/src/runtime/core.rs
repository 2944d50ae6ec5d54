//! The public runtime facade.

use podlite_shared::codes::PodResponse;
use podlite_shared::PodliteResult;

use crate::metrics::MetricsSnapshot;
use crate::runtime::options::PodliteOptions;
use crate::runtime::rt_impl::{PodInfo, RuntimeImpl, SharedRuntimeImpl};
use crate::runtime::types::VmId;

/// PodliteRuntime is the entry point for running and stopping pods.
///
/// **Cloning**: the runtime is cheaply cloneable via `Arc`; all clones share
/// the same pod registry and metrics.
#[derive(Clone)]
pub struct PodliteRuntime {
    rt_impl: SharedRuntimeImpl,
}

impl PodliteRuntime {
    /// Create a runtime rooted at the options' home directory.
    ///
    /// All setup (home and image directories) completes before returning;
    /// there are no partial initialization states.
    pub fn new(options: PodliteOptions) -> PodliteResult<Self> {
        Ok(Self {
            rt_impl: RuntimeImpl::new(options)?,
        })
    }

    /// Run a pod from its JSON spec.
    ///
    /// Boots a fresh `vm-XXXXXXXXXX` microVM, drives it to running, and
    /// returns the first response for that VM id: `{id, code, cause}`.
    pub async fn run_pod(&self, spec_bytes: &[u8]) -> PodliteResult<PodResponse> {
        self.rt_impl.run_pod(spec_bytes).await
    }

    /// Stop a running pod by name and wait for its full teardown.
    pub async fn stop_pod(&self, pod_name: &str) -> PodliteResult<PodResponse> {
        self.rt_impl.stop_pod(pod_name).await
    }

    /// All currently registered pods.
    pub fn list_pods(&self) -> Vec<PodInfo> {
        self.rt_impl.list_pods()
    }

    /// VM id of a registered pod, if any.
    pub fn lookup_vm_id(&self, pod_name: &str) -> Option<VmId> {
        self.rt_impl.lookup_vm_id(pod_name)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.rt_impl.metrics.snapshot()
    }
}

impl std::fmt::Debug for PodliteRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodliteRuntime")
            .field("home_dir", &self.rt_impl.layout.home_dir())
            .finish()
    }
}

// Compile-time assertion that the runtime can cross thread boundaries.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<PodliteRuntime>;
};
