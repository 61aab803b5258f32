use std::fmt;
use std::sync::Arc;

/// Anything addressable by a provider name such as `gemini` or `dryrun`.
pub trait NamedProvider {
    fn name(&self) -> &str;
}

impl<T: NamedProvider + ?Sized> NamedProvider for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProvider {
    pub requested: String,
    pub available: Vec<String>,
}

impl fmt::Display for UnknownProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown provider '{}' (available: {})",
            self.requested,
            self.available.join(", ")
        )
    }
}

impl std::error::Error for UnknownProvider {}

/// Backends for one capability, in registration order. The first backend
/// registered under a name wins.
#[derive(Debug, Clone)]
pub struct ProviderRegistry<T: NamedProvider> {
    providers: Vec<T>,
}

impl<T: NamedProvider> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
        }
    }
}

impl<T: NamedProvider> ProviderRegistry<T> {
    pub fn new(providers: Vec<T>) -> Self {
        Self { providers }
    }

    pub fn register(&mut self, provider: T) {
        self.providers.push(provider);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.providers
            .iter()
            .find(|provider| provider.name() == name)
    }

    /// Sorted, deduplicated names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .iter()
            .map(|provider| provider.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn take(mut self, name: &str) -> Result<T, UnknownProvider> {
        match self
            .providers
            .iter()
            .position(|provider| provider.name() == name)
        {
            Some(index) => Ok(self.providers.swap_remove(index)),
            None => Err(UnknownProvider {
                requested: name.to_string(),
                available: self.names(),
            }),
        }
    }
}
