use crate::bind::{HostPathBinder, BIND_STRATEGY};
use crate::controller::HostPathController;
use crate::predicate::{DiskPressurePredicate, DISK_PRESSURE_PREDICATE};
use crate::prioritize::{DiskUsagePrioritizer, DISK_USE_PRIORITIZE};
use crate::types::*;
use hostpath_lib::{HostPathError, HostPathResult};
use log::info;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Predicate,
    Prioritize,
    Bind,
}

pub enum Strategy {
    Predicate(DiskPressurePredicate),
    Prioritize(DiskUsagePrioritizer),
    Bind(HostPathBinder),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Predicate(_) => StrategyKind::Predicate,
            Strategy::Prioritize(_) => StrategyKind::Prioritize,
            Strategy::Bind(_) => StrategyKind::Bind,
        }
    }
}

/// Named scheduler strategies, built once at startup and shared by the
/// request handlers.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<(String, Strategy)>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The disk pressure predicate, disk usage prioritizer and hostpath binder.
    pub fn with_defaults(controller: Arc<dyn HostPathController>) -> HostPathResult<Self> {
        let mut registry = Self::new();
        registry.register(
            DISK_PRESSURE_PREDICATE,
            Strategy::Predicate(DiskPressurePredicate::new(controller.clone())),
        )?;
        registry.register(
            DISK_USE_PRIORITIZE,
            Strategy::Prioritize(DiskUsagePrioritizer::new(controller.clone())),
        )?;
        registry.register(BIND_STRATEGY, Strategy::Bind(HostPathBinder::new(controller)))?;
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, strategy: Strategy) -> HostPathResult<()> {
        if name.is_empty() {
            return Err(HostPathError::InvalidArgument(
                "strategy name should not be empty".to_string(),
            ));
        }
        if self.strategies.iter().any(|(n, _)| n == name) {
            return Err(HostPathError::AlreadyExists(format!(
                "strategy {} is registered",
                name
            )));
        }
        info!("register scheduler strategy: name={}, kind={:?}", name, strategy.kind());
        self.strategies.push((name.to_string(), strategy));
        Ok(())
    }

    /// Registered names of one kind, in registration order.
    #[cfg(test)]
    pub fn names(&self, kind: StrategyKind) -> Vec<&str> {
        self.strategies
            .iter()
            .filter(|(_, s)| s.kind() == kind)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    fn get(&self, name: &str, kind: StrategyKind) -> HostPathResult<&Strategy> {
        self.strategies
            .iter()
            .find(|(n, s)| n == name && s.kind() == kind)
            .map(|(_, s)| s)
            .ok_or_else(|| HostPathError::NotFound(format!("{:?} strategy {}", kind, name)))
    }

    pub async fn handle_filter(
        &self,
        name: &str,
        args: &ExtenderArgs,
    ) -> HostPathResult<ExtenderFilterResult> {
        match self.get(name, StrategyKind::Predicate)? {
            Strategy::Predicate(p) => Ok(p.filter(name, args).await),
            _ => Err(HostPathError::Internal(format!("strategy {} kind mismatch", name))),
        }
    }

    pub async fn handle_prioritize(
        &self,
        name: &str,
        args: &ExtenderArgs,
    ) -> HostPathResult<Vec<HostPriority>> {
        match self.get(name, StrategyKind::Prioritize)? {
            Strategy::Prioritize(p) => p.prioritize(args).await,
            _ => Err(HostPathError::Internal(format!("strategy {} kind mismatch", name))),
        }
    }

    pub async fn handle_bind(
        &self,
        name: &str,
        args: &ExtenderBindingArgs,
    ) -> HostPathResult<ExtenderBindingResult> {
        match self.get(name, StrategyKind::Bind)? {
            Strategy::Bind(b) => Ok(b.bind(args).await),
            _ => Err(HostPathError::Internal(format!("strategy {} kind mismatch", name))),
        }
    }
}
