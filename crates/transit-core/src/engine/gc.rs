//! Deferred deallocation for the audio thread
//!
//! Command payloads that own heap memory (operation groups, replacement tempo
//! maps) are wrapped in `basedrop::Owned<T>`. When the callback drops one, the
//! pointer is queued and the memory is freed later on the `transit-gc` thread.
//!
//! ```ignore
//! use basedrop::Owned;
//! use crate::engine::gc::gc_handle;
//!
//! let ops = Owned::new(&gc_handle(), OperationGroup::new());
//! control.try_send(Command::ApplyOperations(ops));
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Global collector handle, created on first use
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Collection interval of the GC thread
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

fn spawn_collector() -> Option<Handle> {
    let (tx, rx) = mpsc::channel();

    let spawned = thread::Builder::new()
        .name("transit-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives on this thread only
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }

            log::info!("Transit GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    match spawned {
        Ok(_) => rx.recv().ok(),
        Err(e) => {
            log::error!("Failed to spawn GC thread: {}", e);
            None
        }
    }
}

fn init_gc() -> Handle {
    match spawn_collector() {
        Some(handle) => handle,
        None => {
            // No collector thread: leak a local collector so handles stay valid.
            // Deferred drops then accumulate until process exit.
            log::warn!("Falling back to a detached collector; deferred drops will not be reclaimed");
            let collector = Box::leak(Box::new(Collector::new()));
            collector.handle()
        }
    }
}

/// Get a handle for creating `Owned<T>` / `Shared<T>` allocations
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
