use crate::domain::types::License;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Supplies the usage registered when a license is first activated.
pub trait InitialUsageResolver: Send + Sync {
    fn initial_usage(&self, license: &License, usage_group: &str) -> Option<Decimal>;
}

impl<F> InitialUsageResolver for F
where
    F: Fn(&License, &str) -> Option<Decimal> + Send + Sync,
{
    fn initial_usage(&self, license: &License, usage_group: &str) -> Option<Decimal> {
        self(license, usage_group)
    }
}

/// Ordered resolvers; the first one returning a quantity wins.
#[derive(Clone, Default)]
pub struct InitialUsageResolvers {
    resolvers: Vec<Arc<dyn InitialUsageResolver>>,
}

impl InitialUsageResolvers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resolver: Arc<dyn InitialUsageResolver>) {
        self.resolvers.push(resolver);
    }

    pub fn with(mut self, resolver: impl InitialUsageResolver + 'static) -> Self {
        self.push(Arc::new(resolver));
        self
    }

    pub fn resolve(&self, license: &License, usage_group: &str) -> Option<Decimal> {
        self.resolvers
            .iter()
            .find_map(|resolver| resolver.initial_usage(license, usage_group))
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl std::fmt::Debug for InitialUsageResolvers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitialUsageResolvers")
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}
