use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long a toast keeps showing up in page source after it was posted.
pub const TOAST_TTL: Duration = Duration::from_millis(3500);

/// Toast texts posted by the platform callback, newest last.
#[derive(Debug, Default)]
pub struct ToastBuffer {
    entries: Mutex<VecDeque<(Instant, String)>>,
}

impl ToastBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, text: impl Into<String>) {
        self.push_at(Instant::now(), text.into());
    }

    fn push_at(&self, at: Instant, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        tracing::info!(text = %text, "toast posted");
        let mut entries = self.entries.lock();
        prune(&mut entries, at);
        entries.push_back((at, text));
    }

    /// Toasts still on screen, oldest first.
    pub fn recent(&self) -> Vec<String> {
        self.recent_at(Instant::now())
    }

    fn recent_at(&self, now: Instant) -> Vec<String> {
        let mut entries = self.entries.lock();
        prune(&mut entries, now);
        entries.iter().map(|(_, text)| text.clone()).collect()
    }
}

fn prune(entries: &mut VecDeque<(Instant, String)>, now: Instant) {
    while let Some((at, _)) = entries.front() {
        if now.saturating_duration_since(*at) < TOAST_TTL {
            break;
        }
        entries.pop_front();
    }
}
