//! Runtime internals: the pod registry and the two control jobs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use podlite_shared::codes::{self, PodResponse};
use podlite_shared::{PodliteError, PodliteResult};

use crate::metrics::RuntimeMetrics;
use crate::pod::UserPod;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::PodliteOptions;
use crate::runtime::types::VmId;
use crate::vm::{vm_loop, VmContext, VmEvent};

pub type SharedRuntimeImpl = Arc<RuntimeImpl>;

/// Per-pod registration: the hub to command the VM and the response stream
/// coming back from it.
///
/// The response receiver lives behind an async mutex because two jobs read
/// from it at different times: `run_pod` consumes the first response for its
/// VM id and leaves the channel open; `stop_pod` drains until the shutdown
/// sentinel and then discards the whole registration. Ownership of the
/// channel effectively transfers to the stop path.
struct PodHandle {
    vm_id: VmId,
    created_at: DateTime<Utc>,
    hub: mpsc::Sender<VmEvent>,
    responses: Arc<tokio::sync::Mutex<mpsc::Receiver<PodResponse>>>,
}

/// Public metadata about a registered pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub vm_id: VmId,
    pub created_at: DateTime<Utc>,
}

pub struct RuntimeImpl {
    pub layout: FilesystemLayout,
    pub options: PodliteOptions,
    pub metrics: RuntimeMetrics,
    pods: Mutex<HashMap<String, PodHandle>>,
}

impl RuntimeImpl {
    pub fn new(options: PodliteOptions) -> PodliteResult<SharedRuntimeImpl> {
        let layout = FilesystemLayout::new(options.home_dir.clone());
        std::fs::create_dir_all(layout.home_dir()).map_err(|e| {
            PodliteError::Setup(format!(
                "cannot create home dir {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;
        std::fs::create_dir_all(layout.images_dir()).map_err(|e| {
            PodliteError::Setup(format!(
                "cannot create images dir {}: {}",
                layout.images_dir().display(),
                e
            ))
        })?;

        Ok(Arc::new(Self {
            layout,
            options,
            metrics: RuntimeMetrics::new(),
            pods: Mutex::new(HashMap::new()),
        }))
    }

    /// The RunPod job: parse the spec, boot a fresh VM for it, and return
    /// the first response carrying the new VM id.
    pub async fn run_pod(&self, spec_bytes: &[u8]) -> PodliteResult<PodResponse> {
        // Spec errors surface synchronously; no context is created.
        let spec = UserPod::from_bytes(spec_bytes)?;
        let pod_name = spec.name.clone();

        if self.pods.lock().contains_key(&pod_name) {
            return Err(PodliteError::InvalidState(format!(
                "pod '{}' is already running",
                pod_name
            )));
        }

        let vm_id = VmId::new();
        let (hub_tx, hub_rx) = mpsc::channel(128);
        let (client_tx, client_rx) = mpsc::channel(128);

        let ctx = VmContext::create(
            vm_id.as_str().to_string(),
            self.layout.vm(vm_id.as_str()),
            &self.options.boot,
            self.layout.images_dir(),
            hub_tx.clone(),
            client_tx,
        )
        .inspect_err(|_| self.metrics.incr_failed())?;

        tokio::spawn(vm_loop(ctx, hub_rx));

        let responses = Arc::new(tokio::sync::Mutex::new(client_rx));
        self.pods.lock().insert(
            pod_name.clone(),
            PodHandle {
                vm_id: vm_id.clone(),
                created_at: Utc::now(),
                hub: hub_tx.clone(),
                responses: responses.clone(),
            },
        );

        tracing::info!(pod = %pod_name, vm = %vm_id, "starting pod");
        let networks = self.options.networks;
        if hub_tx
            .send(VmEvent::RunPod {
                spec: Box::new(spec),
                networks,
            })
            .await
            .is_err()
        {
            self.pods.lock().remove(&pod_name);
            self.metrics.incr_failed();
            return Err(PodliteError::Internal("vm loop is gone".into()));
        }

        // Wait for the first response for this VM; skip strays. The response
        // channel stays open: the stop path owns its closure.
        let response = {
            let mut rx = responses.lock().await;
            loop {
                match rx.recv().await {
                    Some(resp) if resp.vm_id == vm_id.as_str() => break resp,
                    Some(resp) => {
                        tracing::debug!(?resp, "skipping response for another vm");
                    }
                    None => {
                        self.pods.lock().remove(&pod_name);
                        self.metrics.incr_failed();
                        return Err(PodliteError::Internal(
                            "response channel closed before pod came up".into(),
                        ));
                    }
                }
            }
        };

        if response.code == codes::VM_RUNNING {
            self.metrics.incr_started();
        } else {
            self.metrics.incr_failed();
        }
        Ok(response)
    }

    /// The Stop job: command a shutdown and wait for the shutdown sentinel.
    /// Deregistering the pod drops the response channel.
    pub async fn stop_pod(&self, pod_name: &str) -> PodliteResult<PodResponse> {
        let (hub, responses) = {
            let pods = self.pods.lock();
            let handle = pods
                .get(pod_name)
                .ok_or_else(|| PodliteError::NotFound(format!("pod '{}'", pod_name)))?;
            (handle.hub.clone(), handle.responses.clone())
        };

        if hub.send(VmEvent::Shutdown).await.is_err() {
            // The vm loop is gone; make sure the registration goes too.
            self.pods.lock().remove(pod_name);
            return Err(PodliteError::InvalidState(format!(
                "pod '{}' is no longer reachable",
                pod_name
            )));
        }

        let response = {
            let mut rx = responses.lock().await;
            loop {
                match rx.recv().await {
                    Some(resp) if resp.code == codes::VM_SHUTDOWN => break resp,
                    Some(resp) => {
                        tracing::debug!(?resp, "response while awaiting shutdown");
                    }
                    None => {
                        break PodResponse::new("", codes::VM_SHUTDOWN, "response channel closed")
                    }
                }
            }
        };

        self.pods.lock().remove(pod_name);
        self.metrics.incr_stopped();
        Ok(response)
    }

    /// All registered pods, newest first.
    pub fn list_pods(&self) -> Vec<PodInfo> {
        let mut pods: Vec<PodInfo> = self
            .pods
            .lock()
            .iter()
            .map(|(name, handle)| PodInfo {
                name: name.clone(),
                vm_id: handle.vm_id.clone(),
                created_at: handle.created_at,
            })
            .collect();
        pods.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pods
    }

    pub fn lookup_vm_id(&self, pod_name: &str) -> Option<VmId> {
        self.pods.lock().get(pod_name).map(|h| h.vm_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_runtime() -> (SharedRuntimeImpl, TempDir) {
        let dir = TempDir::new().unwrap();
        let options = PodliteOptions {
            home_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (RuntimeImpl::new(options).unwrap(), dir)
    }

    #[tokio::test]
    async fn test_bad_spec_is_synchronous() {
        let (rt, _dir) = test_runtime();
        let err = rt.run_pod(b"not json").await.unwrap_err();
        assert!(matches!(err, PodliteError::Spec(_)));
        assert!(rt.list_pods().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_pod() {
        let (rt, _dir) = test_runtime();
        let err = rt.stop_pod("nope").await.unwrap_err();
        assert!(matches!(err, PodliteError::NotFound(_)));
    }
}
