//! Small helpers shared across the runtime.

use rand::Rng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// Generate a VM id: `vm-` followed by 10 random ASCII alpha characters.
///
/// This format is part of the control interface; clients match responses by
/// this id.
pub fn new_vm_id() -> String {
    const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::rng();
    let suffix: String = (0..10)
        .map(|_| ALPHA[rng.random_range(0..ALPHA.len())] as char)
        .collect();
    format!("vm-{}", suffix)
}

/// Generate a container id: 64 lowercase hex chars (OCI convention).
///
/// Uses SHA256 of 32 random bytes, matching what container engines emit.
pub fn new_container_id() -> String {
    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);

    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hex::encode(hasher.finalize())
}

/// Install the file writer as the global tracing subscriber.
///
/// Failure means a subscriber is already set; that is fine for embedders
/// that configure their own.
pub(crate) fn register_to_tracing(
    writer: tracing_appender::non_blocking::NonBlocking,
    env_filter: EnvFilter,
) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .try_init();
}
