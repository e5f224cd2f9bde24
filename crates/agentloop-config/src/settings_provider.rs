use parking_lot::RwLock;

use crate::Settings;

/// Source of settings for the conversation loop. Read once per turn.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> Settings;
}

/// In-memory settings the host can replace between turns.
#[derive(Debug, Default)]
pub struct StaticSettings {
    inner: RwLock<Settings>,
}

impl StaticSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn replace(&self, settings: Settings) {
        *self.inner.write() = settings;
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.inner.write());
    }
}

impl SettingsProvider for StaticSettings {
    fn settings(&self) -> Settings {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_visible_to_next_snapshot() {
        let provider = StaticSettings::default();
        let before = provider.settings();
        provider.update(|s| s.tools.max_iterations = 2);
        assert_eq!(before.tools.max_iterations, 25);
        assert_eq!(provider.settings().tools.max_iterations, 2);
    }
}
