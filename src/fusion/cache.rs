//! Process-wide kernel cache
//!
//! Compiled kernels are keyed by `(Signature, DeviceKey)` and live for the
//! rest of the process. Each key is compiled at most once: concurrent
//! requests for the same key wait on that key's slot while requests for other
//! keys proceed.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::shape::Signature;
use crate::error::{Error, Result};
use crate::runtime::{DeviceKey, KernelSource, Runtime, RuntimeClient};

type Compiled = Arc<dyn Any + Send + Sync>;
type Slot = Arc<Mutex<Option<Compiled>>>;

struct KernelCache {
    slots: RwLock<HashMap<(Signature, DeviceKey), Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn cache() -> &'static KernelCache {
    static CACHE: OnceLock<KernelCache> = OnceLock::new();
    CACHE.get_or_init(|| KernelCache {
        slots: RwLock::new(HashMap::new()),
        hits: AtomicU64::new(0),
        misses: AtomicU64::new(0),
    })
}

/// Get the compiled kernel for `source` on the client's device, compiling it
/// on first request.
///
/// Compilation failures are returned to the caller and not cached.
pub fn kernel<R: Runtime>(source: &KernelSource, client: &R::Client) -> Result<Arc<R::Kernel>> {
    let cache = cache();
    let key = (source.signature.clone(), client.key());

    let existing = cache.slots.read().get(&key).cloned();
    let slot = match existing {
        Some(slot) => slot,
        None => cache.slots.write().entry(key.clone()).or_default().clone(),
    };

    let mut guard = slot.lock();
    if let Some(compiled) = guard.as_ref() {
        cache.hits.fetch_add(1, Ordering::Relaxed);
        log::trace!("kernel cache hit: {} on {}", source.name, key.1);
        return downcast::<R>(compiled.clone(), &source.name);
    }

    cache.misses.fetch_add(1, Ordering::Relaxed);
    log::debug!(
        "kernel cache miss: compiling {} [{}] for {}",
        source.name,
        source.signature,
        key.1
    );
    let kernel = Arc::new(R::compile(source, client)?);
    *guard = Some(kernel.clone() as Compiled);
    Ok(kernel)
}

fn downcast<R: Runtime>(compiled: Compiled, name: &str) -> Result<Arc<R::Kernel>> {
    compiled
        .downcast::<R::Kernel>()
        .map_err(|_| Error::Internal(format!("kernel cache entry '{name}' has the wrong type")))
}

/// Compile (or fetch) `source` for every client in `queues`, in order
///
/// Nothing is launched if any device fails to compile.
pub fn kernels_for<R: Runtime>(
    source: &KernelSource,
    queues: &[R::Client],
) -> Result<Vec<Arc<R::Kernel>>> {
    queues.iter().map(|q| kernel::<R>(source, q)).collect()
}

/// Number of devices `signature` has been compiled for
pub fn compiled_devices(signature: &Signature) -> usize {
    cache()
        .slots
        .read()
        .iter()
        .filter(|((sig, _), slot)| sig == signature && slot.lock().is_some())
        .count()
}

/// Whether `signature` has been compiled for `device`
pub fn is_compiled(signature: &Signature, device: DeviceKey) -> bool {
    let slot = cache()
        .slots
        .read()
        .get(&(signature.clone(), device))
        .cloned();
    slot.is_some_and(|s| s.lock().is_some())
}

/// Process-wide `(hits, misses)` counters
pub fn counters() -> (u64, u64) {
    let cache = cache();
    (
        cache.hits.load(Ordering::Relaxed),
        cache.misses.load(Ordering::Relaxed),
    )
}
