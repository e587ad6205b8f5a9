//! Module registry and dependency resolution
//!
//! Modules are registered in any order and declare the modules they depend
//! on. [`ModuleRegistry::resolve_and_initialize`] walks the dependency graph
//! depth first, so every module initializes after its required dependencies.
//!
//! Resolution failures are per module:
//! - a missing or cyclic required dependency fails the dependent module
//! - a required dependency that itself failed makes its dependents fail too
//! - an absent optional dependency is simply not found at lookup time
//!
//! Other modules keep resolving, and the server starts with whatever
//! initialized.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::router::MessageRouter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("{module} requires {dependency}, which is not registered")]
    Missing {
        module: &'static str,
        dependency: &'static str,
    },

    #[error("{module} and {dependency} depend on each other")]
    Cycle {
        module: &'static str,
        dependency: &'static str,
    },

    #[error("{module} requires {dependency}, which failed to initialize")]
    Unavailable {
        module: &'static str,
        dependency: &'static str,
    },

    #[error("{module} failed to initialize: {reason}")]
    Initialization { module: &'static str, reason: String },
}

impl DependencyError {
    /// The module that failed
    pub fn module(&self) -> &'static str {
        match self {
            DependencyError::Missing { module, .. }
            | DependencyError::Cycle { module, .. }
            | DependencyError::Unavailable { module, .. }
            | DependencyError::Initialization { module, .. } => *module,
        }
    }
}

/// A module's dependency on another module type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    type_id: TypeId,
    type_name: &'static str,
    required: bool,
}

impl Dependency {
    pub fn required<T: Module>() -> Self {
        Self::of::<T>(true)
    }

    pub fn optional<T: Module>() -> Self {
        Self::of::<T>(false)
    }

    fn of<T: Module>(required: bool) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: short_type_name::<T>(),
            required,
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// A server module taking part in dependency resolution and dispatch
pub trait Module: Any + Send + Sync {
    fn name(&self) -> &'static str;

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Called once, after every required dependency initialized
    fn initialize(self: Arc<Self>, ctx: &mut InitContext<'_>) -> Result<(), DependencyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Uninitialized,
    Initializing,
    Initialized,
    Failed,
}

struct Entry {
    name: &'static str,
    type_id: TypeId,
    module: Arc<dyn Module>,
    any: Arc<dyn Any + Send + Sync>,
    state: ModuleState,
}

/// Outcome of a resolution pass
#[derive(Debug, Default)]
pub struct InitReport {
    /// Modules in the order they initialized
    pub order: Vec<&'static str>,
    pub failures: Vec<DependencyError>,
}

impl InitReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What a module sees while it initializes
pub struct InitContext<'a> {
    registry: &'a ModuleRegistry,
    module: &'static str,
    router: &'a mut MessageRouter,
}

impl<'a> InitContext<'a> {
    /// Looks up an initialized module
    pub fn get<T: Module>(&self) -> Option<Arc<T>> {
        self.registry.get::<T>()
    }

    pub fn require<T: Module>(&self) -> Result<Arc<T>, DependencyError> {
        self.get::<T>().ok_or(DependencyError::Missing {
            module: self.module,
            dependency: short_type_name::<T>(),
        })
    }

    pub fn router(&mut self) -> &mut MessageRouter {
        self.router
    }
}

#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<Entry>,
    extra_dependencies: HashMap<TypeId, Vec<Dependency>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module; registering the same type twice replaces the first
    pub fn register<M: Module>(&mut self, module: Arc<M>) {
        let entry = Entry {
            name: module.name(),
            type_id: TypeId::of::<M>(),
            any: Arc::clone(&module) as Arc<dyn Any + Send + Sync>,
            module,
            state: ModuleState::Uninitialized,
        };

        match self.position(entry.type_id) {
            Some(index) => {
                warn!("Module {} registered twice, replacing", entry.name);
                self.entries[index] = entry;
            }
            None => {
                debug!("Registered module {}", entry.name);
                self.entries.push(entry);
            }
        }
    }

    /// Declares a dependency of `M` on `D` on top of what `M` declares itself
    pub fn add_dependency<M: Module, D: Module>(&mut self, required: bool) {
        self.extra_dependencies
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Dependency::of::<D>(required));
    }

    /// Returns the module of type `T` if it initialized
    pub fn get<T: Module>(&self) -> Option<Arc<T>> {
        let index = self.position(TypeId::of::<T>())?;
        let entry = &self.entries[index];
        if entry.state != ModuleState::Initialized {
            return None;
        }
        Arc::clone(&entry.any).downcast::<T>().ok()
    }

    pub fn state_of<T: Module>(&self) -> Option<ModuleState> {
        self.position(TypeId::of::<T>())
            .map(|index| self.entries[index].state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Initializes every registered module in dependency order
    ///
    /// Modules that already initialized in an earlier pass are skipped.
    pub fn resolve_and_initialize(&mut self, router: &mut MessageRouter) -> InitReport {
        let mut report = InitReport::default();
        for index in 0..self.entries.len() {
            self.visit(index, router, &mut report);
        }

        info!(
            "Initialized {} of {} modules",
            report.order.len(),
            self.entries.len()
        );
        report
    }

    fn position(&self, type_id: TypeId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.type_id == type_id)
    }

    fn dependencies_of(&self, index: usize) -> Vec<Dependency> {
        let entry = &self.entries[index];
        let mut dependencies = entry.module.dependencies();
        if let Some(extra) = self.extra_dependencies.get(&entry.type_id) {
            dependencies.extend(extra.iter().copied());
        }
        dependencies
    }

    /// Returns true when the module ends up initialized
    fn visit(&mut self, index: usize, router: &mut MessageRouter, report: &mut InitReport) -> bool {
        match self.entries[index].state {
            ModuleState::Initialized => return true,
            ModuleState::Failed => return false,
            // only reachable through a cycle, which the caller reports
            ModuleState::Initializing => return false,
            ModuleState::Uninitialized => {}
        }

        let name = self.entries[index].name;
        self.entries[index].state = ModuleState::Initializing;

        for dependency in self.dependencies_of(index) {
            let Some(dep_index) = self.position(dependency.type_id) else {
                if dependency.required {
                    return self.fail(
                        index,
                        report,
                        DependencyError::Missing {
                            module: name,
                            dependency: dependency.type_name,
                        },
                    );
                }
                debug!(
                    "{}: optional dependency {} is not registered",
                    name, dependency.type_name
                );
                continue;
            };

            if self.entries[dep_index].state == ModuleState::Initializing {
                if dependency.required {
                    return self.fail(
                        index,
                        report,
                        DependencyError::Cycle {
                            module: name,
                            dependency: dependency.type_name,
                        },
                    );
                }
                warn!(
                    "{}: optional dependency {} is part of a cycle, skipping",
                    name, dependency.type_name
                );
                continue;
            }

            if !self.visit(dep_index, router, report) && dependency.required {
                return self.fail(
                    index,
                    report,
                    DependencyError::Unavailable {
                        module: name,
                        dependency: dependency.type_name,
                    },
                );
            }
        }

        let module = Arc::clone(&self.entries[index].module);
        let result = {
            let mut ctx = InitContext {
                registry: &*self,
                module: name,
                router: &mut *router,
            };
            module.initialize(&mut ctx)
        };

        match result {
            Ok(()) => {
                info!("Module {} initialized", name);
                self.entries[index].state = ModuleState::Initialized;
                report.order.push(name);
                true
            }
            Err(err) => self.fail(index, report, err),
        }
    }

    fn fail(&mut self, index: usize, report: &mut InitReport, err: DependencyError) -> bool {
        error!("Module {} failed: {}", self.entries[index].name, err);
        self.entries[index].state = ModuleState::Failed;
        report.failures.push(err);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    macro_rules! test_module {
        ($ty:ident, [$($dep:expr),*]) => {
            struct $ty {
                log: Log,
            }

            impl Module for $ty {
                fn name(&self) -> &'static str {
                    stringify!($ty)
                }

                fn dependencies(&self) -> Vec<Dependency> {
                    vec![$($dep),*]
                }

                fn initialize(self: Arc<Self>, _ctx: &mut InitContext<'_>) -> Result<(), DependencyError> {
                    self.log.lock().unwrap().push(stringify!($ty));
                    Ok(())
                }
            }
        };
    }

    test_module!(Storage, []);
    test_module!(Accounts, [Dependency::required::<Storage>()]);
    test_module!(Shop, [Dependency::required::<Accounts>(), Dependency::optional::<Mailer>()]);
    test_module!(Mailer, []);
    test_module!(Orphan, [Dependency::required::<Mailer>()]);
    test_module!(Ping, [Dependency::required::<Pong>()]);
    test_module!(Pong, [Dependency::required::<Ping>()]);

    struct Broken;

    impl Module for Broken {
        fn name(&self) -> &'static str {
            "Broken"
        }

        fn initialize(self: Arc<Self>, ctx: &mut InitContext<'_>) -> Result<(), DependencyError> {
            ctx.require::<Mailer>()?;
            Ok(())
        }
    }

    #[test]
    fn test_dependencies_initialize_first() {
        let log: Log = Arc::default();
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Shop { log: Arc::clone(&log) }));
        registry.register(Arc::new(Accounts { log: Arc::clone(&log) }));
        registry.register(Arc::new(Storage { log: Arc::clone(&log) }));

        let mut router = MessageRouter::new();
        let report = registry.resolve_and_initialize(&mut router);

        assert!(report.is_ok());
        assert_eq!(report.order, vec!["Storage", "Accounts", "Shop"]);
        assert_eq!(*log.lock().unwrap(), vec!["Storage", "Accounts", "Shop"]);
        assert!(registry.get::<Shop>().is_some());
    }

    #[test]
    fn test_missing_required_dependency_fails_only_dependent() {
        let log: Log = Arc::default();
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Orphan { log: Arc::clone(&log) }));
        registry.register(Arc::new(Storage { log: Arc::clone(&log) }));

        let report = registry.resolve_and_initialize(&mut MessageRouter::new());

        assert_eq!(
            report.failures,
            vec![DependencyError::Missing {
                module: "Orphan",
                dependency: "Mailer",
            }]
        );
        assert_eq!(report.order, vec!["Storage"]);
        assert!(registry.get::<Orphan>().is_none());
        assert_eq!(registry.state_of::<Orphan>(), Some(ModuleState::Failed));
    }

    #[test]
    fn test_missing_optional_dependency_is_not_found() {
        let log: Log = Arc::default();
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Storage { log: Arc::clone(&log) }));
        registry.register(Arc::new(Accounts { log: Arc::clone(&log) }));
        registry.register(Arc::new(Shop { log: Arc::clone(&log) }));

        let report = registry.resolve_and_initialize(&mut MessageRouter::new());

        assert!(report.is_ok());
        assert!(registry.get::<Shop>().is_some());
        assert!(registry.get::<Mailer>().is_none());
        assert_eq!(registry.state_of::<Mailer>(), None);
    }

    #[test]
    fn test_cycle_is_reported() {
        let log: Log = Arc::default();
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Ping { log: Arc::clone(&log) }));
        registry.register(Arc::new(Pong { log: Arc::clone(&log) }));
        registry.register(Arc::new(Storage { log: Arc::clone(&log) }));

        let report = registry.resolve_and_initialize(&mut MessageRouter::new());

        assert!(report.failures.contains(&DependencyError::Cycle {
            module: "Pong",
            dependency: "Ping",
        }));
        assert!(report.failures.contains(&DependencyError::Unavailable {
            module: "Ping",
            dependency: "Pong",
        }));
        assert_eq!(report.order, vec!["Storage"]);
        assert!(log.lock().unwrap().iter().all(|name| *name == "Storage"));
    }

    #[test]
    fn test_failed_dependency_propagates() {
        let log: Log = Arc::default();
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Accounts { log: Arc::clone(&log) }));
        registry.add_dependency::<Accounts, Orphan>(true);
        registry.register(Arc::new(Orphan { log: Arc::clone(&log) }));
        registry.register(Arc::new(Storage { log: Arc::clone(&log) }));

        let report = registry.resolve_and_initialize(&mut MessageRouter::new());

        assert!(report.failures.contains(&DependencyError::Unavailable {
            module: "Accounts",
            dependency: "Orphan",
        }));
        assert_eq!(registry.state_of::<Accounts>(), Some(ModuleState::Failed));
        assert!(registry.get::<Storage>().is_some());
    }

    #[test]
    fn test_initializer_failure_is_reported() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Broken));

        let report = registry.resolve_and_initialize(&mut MessageRouter::new());

        assert_eq!(
            report.failures,
            vec![DependencyError::Missing {
                module: "Broken",
                dependency: "Mailer",
            }]
        );
        assert!(registry.get::<Broken>().is_none());
    }
}
