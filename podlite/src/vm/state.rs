//! The per-VM state machine.
//!
//! A single dispatch task consumes the hub and invokes the handler for the
//! current state; no handler ever runs concurrently with another on the same
//! context. Transitions are point-in-time replacements of the state field
//! under the context lock. The terminal state is the absence of a state:
//! `VmContext::close` nils the field as its last step.

use std::sync::Arc;

use tokio::sync::mpsc;

use podlite_shared::codes;
use podlite_shared::{Frame, MessageCode};

use crate::net;
use crate::storage;
use crate::vm::context::VmContext;
use crate::vm::events::{BlockdevSource, PrepTarget, VmEvent};

/// Lifecycle states of a VM context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Sockets listening; no QEMU yet.
    Init,
    /// QEMU launched; awaiting the QMP and agent handshakes.
    Starting,
    /// Spec ingested; helpers materializing devices.
    Preparing,
    /// All devices present; RunPod sent, awaiting the guest ack.
    AwaitingAck,
    /// Workload executing.
    Running,
    /// Stop issued; draining teardown work and the process exit.
    ShuttingDown,
    /// Reversing host-side resources; the next step is closed.
    Cleaning,
}

/// Drive one VM context until it closes.
pub async fn vm_loop(ctx: Arc<VmContext>, mut hub_rx: mpsc::Receiver<VmEvent>) {
    while let Some(event) = hub_rx.recv().await {
        let Some(state) = ctx.current_state() else {
            break;
        };

        tracing::trace!(vm = %ctx.id(), state = ?state, event = event.kind(), "dispatch");
        match state {
            VmState::Init => handle_init(&ctx, event).await,
            VmState::Starting => handle_starting(&ctx, event).await,
            VmState::Preparing => handle_preparing(&ctx, event).await,
            VmState::AwaitingAck => handle_awaiting_ack(&ctx, event).await,
            VmState::Running => handle_running(&ctx, event).await,
            VmState::ShuttingDown => handle_shutting_down(&ctx, event).await,
            VmState::Cleaning => drop_event(&ctx, VmState::Cleaning, event),
        }

        if ctx.current_state().is_none() {
            break;
        }
    }
    tracing::debug!(vm = %ctx.id(), "dispatch loop finished");
}

fn drop_event(ctx: &VmContext, state: VmState, event: VmEvent) {
    tracing::debug!(vm = %ctx.id(), state = ?state, event = event.kind(), "dropping event");
}

async fn handle_init(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::RunPod { spec, networks } => {
            ctx.init_device_context(*spec, networks);
            match ctx.launch_qemu() {
                Ok(()) => ctx.become_state(VmState::Starting),
                Err(e) => {
                    ctx.reply(codes::VM_START_FAILED, e.to_string()).await;
                    enter_shutdown(ctx, false).await;
                }
            }
        }
        VmEvent::Shutdown => {
            enter_shutdown(ctx, false).await;
        }
        other => drop_event(ctx, VmState::Init, other),
    }
}

async fn handle_starting(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::QmpReady => {
            let both = {
                let mut inner = ctx.inner.lock();
                inner.qmp_ready = true;
                inner.qmp_ready && inner.agent_ready
            };
            if both {
                begin_preparing(ctx).await;
            }
        }
        VmEvent::AgentReady => {
            let both = {
                let mut inner = ctx.inner.lock();
                inner.agent_ready = true;
                inner.qmp_ready && inner.agent_ready
            };
            if both {
                begin_preparing(ctx).await;
            }
        }
        VmEvent::Shutdown => enter_shutdown(ctx, false).await,
        VmEvent::QmpFailed { cause } => {
            ctx.reply(codes::VM_START_FAILED, format!("qmp failed: {}", cause))
                .await;
            enter_shutdown(ctx, false).await;
        }
        VmEvent::ProcessExited { status } => {
            ctx.inner.lock().process_exited = true;
            ctx.reply(
                codes::VM_START_FAILED,
                format!("qemu exited during startup: {:?}", status),
            )
            .await;
            enter_shutdown(ctx, false).await;
        }
        VmEvent::WatchdogFired | VmEvent::TransportError { .. } => {
            ctx.reply(codes::VM_START_FAILED, "lost the guest during startup")
                .await;
            enter_shutdown(ctx, false).await;
        }
        other => drop_event(ctx, VmState::Starting, other),
    }
}

/// Both handshakes done: launch the preparation helpers and move on.
async fn begin_preparing(ctx: &Arc<VmContext>) {
    let (containers, volumes, networks) = {
        let inner = ctx.inner.lock();
        let Some(spec) = inner.user_spec.as_ref() else {
            return;
        };
        (
            spec.containers.clone(),
            spec.volumes.clone(),
            inner.networks,
        )
    };

    for (index, container) in containers.into_iter().enumerate() {
        tokio::spawn(storage::create_container(
            index,
            container,
            ctx.layout().clone(),
            ctx.images_dir().clone(),
            ctx.hub(),
        ));
    }
    for volume in volumes {
        tokio::spawn(storage::prepare_volume(
            volume,
            ctx.layout().clone(),
            ctx.hub(),
        ));
    }
    if networks > 0 {
        tokio::spawn(net::create_interfaces(
            ctx.id().to_string(),
            networks,
            ctx.hub(),
        ));
    }

    ctx.become_state(VmState::Preparing);
}

async fn handle_preparing(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::ContainerCreated(info) => {
            let plug = {
                let mut guard = ctx.inner.lock();
                let inner = &mut *guard;
                let Some(vm_spec) = inner.vm_spec.as_mut() else {
                    return;
                };
                let image = info.image.clone();
                let need_insert =
                    inner
                        .devices
                        .container_created(vm_spec, &mut inner.progress, info);
                need_insert.then_some(image)
            };
            if let Some(image) = plug {
                ctx.insert_blockdev(image.clone(), BlockdevSource::Image, image, "raw".into())
                    .await;
            }
            check_ready(ctx).await;
        }
        VmEvent::VolumeReady(info) => {
            let plug = {
                let mut guard = ctx.inner.lock();
                let inner = &mut *guard;
                let Some(vm_spec) = inner.vm_spec.as_mut() else {
                    return;
                };
                let name = info.name.clone();
                let filepath = info.filepath.clone();
                let format = info.format.clone();
                let need_insert = inner
                    .devices
                    .volume_ready(vm_spec, &mut inner.progress, info);
                need_insert.then_some((name, filepath, format))
            };
            if let Some((name, filepath, format)) = plug {
                ctx.insert_blockdev(name, BlockdevSource::Volume, filepath, format)
                    .await;
            }
            check_ready(ctx).await;
        }
        VmEvent::BlockdevInserted(info) => {
            {
                let mut guard = ctx.inner.lock();
                let inner = &mut *guard;
                let Some(vm_spec) = inner.vm_spec.as_mut() else {
                    return;
                };
                inner
                    .devices
                    .blockdev_inserted(vm_spec, &mut inner.progress, info);
            }
            check_ready(ctx).await;
        }
        VmEvent::InterfaceCreated(info) => {
            let (index, host_device) = (info.index, info.host_device.clone());
            ctx.inner.lock().devices.interface_created(info);
            ctx.insert_netdev(index, host_device).await;
        }
        VmEvent::NetdevInserted { index } => {
            {
                let mut guard = ctx.inner.lock();
                let inner = &mut *guard;
                let Some(vm_spec) = inner.vm_spec.as_mut() else {
                    return;
                };
                inner
                    .devices
                    .netdev_inserted(vm_spec, &mut inner.progress, index);
            }
            check_ready(ctx).await;
        }
        VmEvent::PrepFailed { target, cause } => {
            tracing::warn!(vm = %ctx.id(), %target, %cause, "preparation failed");
            clear_prep_target(ctx, &target);
            ctx.reply(codes::DEVICE_FAILED, format!("{}: {}", target, cause))
                .await;
            enter_shutdown(ctx, true).await;
        }
        VmEvent::Shutdown => enter_shutdown(ctx, true).await,
        other => {
            if !handle_session_event(ctx, &other) {
                handle_fatal(ctx, other).await;
            }
        }
    }
}

/// All pending async work done: hand the resolved pod to the guest.
async fn check_ready(ctx: &Arc<VmContext>) {
    let ready = ctx.inner.lock().progress.device_ready();
    if !ready {
        return;
    }

    tracing::info!(vm = %ctx.id(), "devices ready, sending run-pod to guest");
    match ctx.send_run_pod().await {
        Ok(()) => ctx.become_state(VmState::AwaitingAck),
        Err(e) => {
            ctx.reply(codes::DEVICE_FAILED, e.to_string()).await;
            enter_shutdown(ctx, true).await;
        }
    }
}

async fn handle_awaiting_ack(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::AgentAck => {
            ctx.reply(codes::VM_RUNNING, "pod started").await;
            ctx.become_state(VmState::Running);
        }
        VmEvent::AgentError { cause } => {
            ctx.reply(codes::DEVICE_FAILED, format!("guest rejected pod: {}", cause))
                .await;
            enter_shutdown(ctx, true).await;
        }
        VmEvent::Shutdown => enter_shutdown(ctx, true).await,
        other => {
            if !handle_session_event(ctx, &other) {
                handle_fatal(ctx, other).await;
            }
        }
    }
}

async fn handle_running(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::Shutdown => enter_shutdown(ctx, true).await,
        VmEvent::AgentError { cause } => {
            // Per-container failures are reported but do not take the VM down.
            ctx.reply(codes::EXEC_ERROR, cause).await;
        }
        VmEvent::AgentExit { code } => {
            ctx.reply(codes::OK, format!("container exited with code {}", code))
                .await;
        }
        VmEvent::AgentFinished => {
            ctx.reply(codes::OK, "pod finished").await;
        }
        other => {
            if !handle_session_event(ctx, &other) {
                handle_fatal(ctx, other).await;
            }
        }
    }
}

async fn handle_shutting_down(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        // Outstanding helpers finish or fail; both clear pending work.
        VmEvent::ContainerCreated(info) => {
            ctx.inner.lock().progress.container_done(info.index);
            maybe_finish_shutdown(ctx).await;
        }
        VmEvent::VolumeReady(info) => {
            ctx.inner.lock().progress.volume_done(&info.name);
            maybe_finish_shutdown(ctx).await;
        }
        VmEvent::BlockdevInserted(info) => {
            ctx.inner.lock().progress.blockdev_done(&info.name);
            maybe_finish_shutdown(ctx).await;
        }
        VmEvent::InterfaceCreated(info) => {
            ctx.inner.lock().progress.network_done(info.index);
            maybe_finish_shutdown(ctx).await;
        }
        VmEvent::NetdevInserted { index } => {
            ctx.inner.lock().progress.network_done(index);
            maybe_finish_shutdown(ctx).await;
        }
        VmEvent::PrepFailed { target, cause } => {
            tracing::debug!(vm = %ctx.id(), %target, %cause, "late preparation failure");
            clear_prep_target(ctx, &target);
            maybe_finish_shutdown(ctx).await;
        }

        // Teardown family completions.
        VmEvent::ContainerUnmounted { index, success } => {
            {
                let mut inner = ctx.inner.lock();
                inner.progress.deleting.containers.remove(&index);
                inner.progress.finished.containers.insert(index);
                if !success {
                    tracing::warn!(vm = %ctx.id(), index, "container teardown reported failure");
                }
            }
            maybe_finish_shutdown(ctx).await;
        }
        VmEvent::VolumeUnmounted { name, success } => {
            {
                let mut inner = ctx.inner.lock();
                inner.progress.deleting.volumes.remove(&name);
                inner.progress.finished.volumes.insert(name.clone());
                if !success {
                    tracing::warn!(vm = %ctx.id(), volume = %name, "volume teardown reported failure");
                }
            }
            maybe_finish_shutdown(ctx).await;
        }
        VmEvent::DmDeviceRemoved { name, success } => {
            {
                let mut inner = ctx.inner.lock();
                inner.progress.deleting.blockdevs.remove(&name);
                inner.progress.finished.blockdevs.insert(name.clone());
                if !success {
                    tracing::warn!(vm = %ctx.id(), blockdev = %name, "dm teardown reported failure");
                }
            }
            maybe_finish_shutdown(ctx).await;
        }

        VmEvent::ProcessExited { status } => {
            tracing::info!(vm = %ctx.id(), ?status, "qemu exited");
            ctx.inner.lock().process_exited = true;
            maybe_finish_shutdown(ctx).await;
        }

        // A silent guest will never honor the stop; force the process down.
        VmEvent::WatchdogFired => {
            tracing::warn!(vm = %ctx.id(), "guest silent during shutdown, killing qemu");
            ctx.kill_qemu();
        }

        // Already shutting down; liveness noise is expected here.
        VmEvent::QmpFailed { .. }
        | VmEvent::TransportError { .. }
        | VmEvent::Shutdown
        | VmEvent::AgentAck
        | VmEvent::AgentError { .. }
        | VmEvent::AgentExit { .. }
        | VmEvent::AgentFinished => {}

        other => {
            if !handle_session_event(ctx, &other) {
                drop_event(ctx, VmState::ShuttingDown, other);
            }
        }
    }
}

/// Tty attach bookkeeping; valid in every live state.
fn handle_session_event(ctx: &Arc<VmContext>, event: &VmEvent) -> bool {
    match event {
        VmEvent::Attach {
            attach_id,
            tag,
            output,
        } => {
            let mut inner = ctx.inner.lock();
            if !inner.tty.attach(tag.clone(), *attach_id, output.clone()) {
                tracing::warn!(vm = %ctx.id(), attach_id, %tag, "attach to unknown session");
            }
            true
        }
        VmEvent::Detach { tag } => {
            ctx.inner.lock().tty.detach(tag);
            true
        }
        VmEvent::TtyOutput { attach_id, data } => {
            ctx.inner.lock().tty.output(*attach_id, data);
            true
        }
        VmEvent::TtyClosed { attach_id } => {
            ctx.inner.lock().tty.close_session(*attach_id);
            true
        }
        _ => false,
    }
}

/// Fatal failures shared by the live states; anything else is dropped.
async fn handle_fatal(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::WatchdogFired => {
            ctx.reply(codes::VM_LOST, "guest agent went silent").await;
            enter_shutdown(ctx, false).await;
        }
        VmEvent::ProcessExited { status } => {
            ctx.inner.lock().process_exited = true;
            ctx.reply(
                codes::VM_LOST,
                format!("qemu exited unexpectedly: {:?}", status),
            )
            .await;
            enter_shutdown(ctx, false).await;
        }
        VmEvent::QmpFailed { cause } | VmEvent::TransportError { cause, .. } => {
            ctx.reply(codes::VM_LOST, cause).await;
            enter_shutdown(ctx, false).await;
        }
        other => {
            if let Some(state) = ctx.current_state() {
                drop_event(ctx, state, other);
            }
        }
    }
}

fn clear_prep_target(ctx: &Arc<VmContext>, target: &PrepTarget) {
    let mut inner = ctx.inner.lock();
    match target {
        PrepTarget::Container(idx) => {
            inner.progress.adding.containers.remove(idx);
        }
        PrepTarget::Volume(name) => {
            inner.progress.adding.volumes.remove(name);
        }
        PrepTarget::Blockdev(name) => {
            inner.progress.adding.blockdevs.remove(name);
        }
        PrepTarget::Network(idx) => {
            inner.progress.adding.networks.remove(idx);
        }
    }
}

/// Begin teardown. Graceful shutdown asks the guest to stop and unplugs
/// devices through QMP; the fatal path kills the process and only reverses
/// host-side resources, since the devices die with it.
async fn enter_shutdown(ctx: &Arc<VmContext>, graceful: bool) {
    {
        let mut inner = ctx.inner.lock();
        if inner.qemu_pid.is_none() {
            // QEMU never launched; there is no exit to wait for.
            inner.process_exited = true;
        }
    }

    if graceful {
        ctx.send_agent(Frame::bare(MessageCode::Shutdown)).await;
        ctx.remove_volume_drives().await;
        ctx.remove_image_drives().await;
    } else {
        ctx.kill_qemu();
    }

    ctx.release_volume_dirs();
    ctx.release_overlay_dirs();
    ctx.remove_dm_devices();

    ctx.become_state(VmState::ShuttingDown);
    maybe_finish_shutdown(ctx).await;
}

/// All pending work drained and the process gone: clean and close.
async fn maybe_finish_shutdown(ctx: &Arc<VmContext>) {
    let done = {
        let inner = ctx.inner.lock();
        inner.progress.device_ready() && inner.process_exited
    };
    if !done {
        return;
    }

    ctx.become_state(VmState::Cleaning);

    let (vm_id, networks) = {
        let inner = ctx.inner.lock();
        (ctx.id().to_string(), inner.networks)
    };
    if networks > 0 {
        tokio::spawn(async move {
            net::remove_interfaces(&vm_id, networks).await;
        });
    }

    ctx.close();
    ctx.reply(codes::VM_SHUTDOWN, "vm terminated").await;
}
