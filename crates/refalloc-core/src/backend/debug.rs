//! Debug backend: host allocation recorded in the tracking ledger.

use std::ptr::NonNull;

use super::host;
use crate::header::{Memory, block_of};
use crate::registry::{Backend, BackendConfig};
use crate::tracking::{DebugSite, ledger};

#[derive(Debug, Clone, Copy, Default)]
pub struct DebugBackend;

fn site_of(config: &BackendConfig) -> Option<DebugSite> {
    match config {
        BackendConfig::Debug(site) => Some(*site),
        _ => None,
    }
}

/// Whether `mem` is a live block in the debug ledger.
#[must_use]
pub fn is_tracked(mem: Memory) -> bool {
    ledger().contains(block_of(mem).as_ptr() as usize)
}

// SAFETY: plain host blocks; the ledger only stores addresses.
unsafe impl Backend for DebugBackend {
    fn name(&self) -> &str {
        "debug"
    }

    fn allocate(&self, config: &BackendConfig, size: usize) -> Option<NonNull<u8>> {
        let block = host::malloc(size)?;
        let site = site_of(config).unwrap_or(DebugSite::UNKNOWN);
        ledger().track(block.as_ptr() as usize, size, site);
        Some(block)
    }

    unsafe fn reallocate(
        &self,
        config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let ledger = ledger();
        // Detach first: once realloc returns, the old address may be reused
        // by another thread's allocation.
        let prior = ledger.detach(block.as_ptr() as usize);
        // A resize without site information keeps the recorded one.
        let site = site_of(config)
            .or_else(|| prior.as_ref().map(|entry| entry.site))
            .unwrap_or(DebugSite::UNKNOWN);
        // SAFETY: block is a live host block (trait contract).
        match unsafe { host::realloc(block, size) } {
            Some(resized) => {
                ledger.track_replaced(prior, resized.as_ptr() as usize, size, site);
                Some(resized)
            }
            None => {
                if let Some(prior) = prior {
                    ledger.reinsert(prior);
                }
                None
            }
        }
    }

    unsafe fn deallocate(&self, block: NonNull<u8>) {
        ledger().untrack(block.as_ptr() as usize);
        // SAFETY: block is a live host block (trait contract).
        unsafe { host::free(block) };
    }
}
