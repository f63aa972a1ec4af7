//! Reference-counted "prevent idle sleep" claims.
//!
//! Group downloads can run for hours; while any is active the process holds
//! one claim. Claims nest, so concurrent group downloads compose. The
//! platform-specific assertion is pluggable; the default only logs, since
//! platform integration lives outside the engine.

use std::sync::Mutex;

use tracing::debug;

/// Platform hook invoked when the claim count moves between zero and nonzero.
pub trait KeepAwake: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

pub struct Caffeination {
    count: Mutex<u64>,
    hook: Option<Box<dyn KeepAwake>>,
}

impl Caffeination {
    pub fn new(hook: Option<Box<dyn KeepAwake>>) -> Caffeination {
        Caffeination {
            count: Mutex::new(0),
            hook,
        }
    }

    pub fn add(&self) {
        let mut count = self.count.lock().expect("caffeination lock");
        *count += 1;
        if *count == 1 {
            debug!("Preventing idle sleep");
            if let Some(hook) = &self.hook {
                hook.acquire();
            }
        }
    }

    pub fn remove(&self) {
        let mut count = self.count.lock().expect("caffeination lock");
        debug_assert!(*count > 0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            debug!("Allowing idle sleep");
            if let Some(hook) = &self.hook {
                hook.release();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> bool {
        *self.count.lock().expect("caffeination lock") > 0
    }
}

impl Default for Caffeination {
    fn default() -> Self {
        Caffeination::new(None)
    }
}
