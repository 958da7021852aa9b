use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(u64);

impl WindowId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window#{}", self.0)
    }
}

/// Identity of one loaded document; never live again after its window
/// navigates away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    window: WindowId,
    id: Uuid,
    url: String,
}

impl Page {
    pub(crate) fn new(window: WindowId, url: &str) -> Self {
        Self { window, id: Uuid::new_v4(), url: url.to_string() }
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.window, self.url)
    }
}

pub(crate) struct LivenessTracker {
    current: RwLock<HashMap<WindowId, Page>>,
}

impl LivenessTracker {
    pub(crate) fn new() -> Self {
        Self { current: RwLock::new(HashMap::new()) }
    }

    pub(crate) fn navigate(&self, window: WindowId, page: &Page) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current.insert(window, page.clone());
    }

    pub(crate) fn close(&self, window: WindowId) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current.remove(&window);
    }

    pub(crate) fn is_live(&self, page: &Page) -> bool {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.get(&page.window()).map(|live| live.id() == page.id()).unwrap_or(false)
    }

    pub(crate) fn current_page(&self, window: WindowId) -> Option<Page> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.get(&window).cloned()
    }
}
