use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::error::GuardianResult;

/// Platform actions the router delegates to the extension host.
#[async_trait]
pub trait ExtensionHost: Send + Sync {
    /// Makes sure the privileged context that owns the peer session exists.
    /// Returns `true` when it had to be created.
    async fn ensure_offscreen(&self) -> GuardianResult<bool>;
    async fn open_options_page(&self) -> GuardianResult<()>;
}

/// Host for running every context inside one process.
#[derive(Debug)]
pub struct InProcessHost {
    offscreen_url: String,
    options_url: String,
    offscreen: AtomicBool,
    options_opened: AtomicUsize,
}

impl InProcessHost {
    pub fn new(offscreen_url: impl Into<String>, options_url: impl Into<String>) -> Self {
        Self {
            offscreen_url: offscreen_url.into(),
            options_url: options_url.into(),
            offscreen: AtomicBool::new(false),
            options_opened: AtomicUsize::new(0),
        }
    }

    pub fn options_opened(&self) -> usize {
        self.options_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtensionHost for InProcessHost {
    async fn ensure_offscreen(&self) -> GuardianResult<bool> {
        let created = !self.offscreen.swap(true, Ordering::SeqCst);
        if created {
            info!(target = "guardian::router", url = %self.offscreen_url, "offscreen context created");
        }
        Ok(created)
    }

    async fn open_options_page(&self) -> GuardianResult<()> {
        self.options_opened.fetch_add(1, Ordering::SeqCst);
        info!(target = "guardian::router", url = %self.options_url, "opening options page");
        Ok(())
    }
}
