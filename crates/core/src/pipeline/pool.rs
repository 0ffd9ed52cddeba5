use candle_core::Tensor;

use super::backend::NamedTensors;

/// Outputs produced by earlier stages of the current step.
///
/// Lives for exactly one step. A later stage producing the same name
/// replaces the earlier entry.
#[derive(Debug, Default)]
pub struct NamedValuePool {
    values: NamedTensors,
}

impl NamedValuePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.values.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
