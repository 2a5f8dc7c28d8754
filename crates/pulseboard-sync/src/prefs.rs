//! Boolean preference storage used for transfer filters.

use std::collections::HashMap;

pub trait PreferenceStore {
    fn get_bool(&self, name: &str) -> Option<bool>;
    fn set_bool(&mut self, name: &str, value: bool);
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    values: HashMap<String, bool>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: bool) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).copied()
    }

    fn set_bool(&mut self, name: &str, value: bool) {
        self.values.insert(name.to_string(), value);
    }
}
