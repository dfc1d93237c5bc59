use std::sync::Arc;

use parking_lot::RwLock;

pub const DEFAULT_LANGUAGE: &str = "en";

/// The language the current runner is producing text in.
///
/// One of these is owned by each runner; clones share the same slot. The
/// language is only ever changed through [`Translation::scoped`], so every
/// change is undone when the scope ends, including on unwind.
#[derive(Debug, Clone)]
pub struct Translation {
    current: Arc<RwLock<String>>,
}

impl Default for Translation {
    fn default() -> Self {
        Self::new(DEFAULT_LANGUAGE)
    }
}

impl Translation {
    #[must_use]
    pub fn new(language: &str) -> Self {
        Self {
            current: Arc::new(RwLock::new(language.to_string())),
        }
    }

    pub fn current(&self) -> String {
        self.current.read().clone()
    }

    /// Switch to `language` until the returned guard is dropped
    #[must_use = "the previous language is restored as soon as the scope is dropped"]
    pub fn scoped(&self, language: &str) -> LanguageScope {
        let previous = std::mem::replace(&mut *self.current.write(), language.to_string());
        LanguageScope {
            slot: Arc::clone(&self.current),
            previous: Some(previous),
        }
    }
}

#[derive(Debug)]
pub struct LanguageScope {
    slot: Arc<RwLock<String>>,
    previous: Option<String>,
}

impl Drop for LanguageScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.slot.write() = previous;
        }
    }
}
