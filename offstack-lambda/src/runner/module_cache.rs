//! Reloadable handler modules
//!
//! Native handlers are published to a [`HandlerRegistry`] as module
//! factories keyed by module path (the handler string up to its last `.`).
//! The [`ModuleCache`] keeps instantiated modules keyed by resolved file path
//! and decides, per [`ReloadPolicy`], when to build a fresh one.

use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::in_process::Handler;
use crate::config::ReloadPolicy;
use crate::invocation::InvocationError;

/// Named exports of one instantiated module
#[derive(Clone, Default)]
pub struct HandlerModule {
    exports: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.exports.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.exports.get(name).cloned()
    }
}

impl fmt::Debug for HandlerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerModule")
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub type ModuleFactory = Arc<dyn Fn() -> HandlerModule + Send + Sync>;

/// Module factories available to the in-process and worker backends
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    modules: Arc<DashMap<String, ModuleFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory; every instantiation starts from fresh state
    pub fn register_module<F>(&self, module_path: &str, factory: F)
    where
        F: Fn() -> HandlerModule + Send + Sync + 'static,
    {
        self.modules
            .insert(normalize(module_path), Arc::new(factory));
    }

    /// Register a single handler under a `module.export` handler string
    pub fn register(&self, handler: &str, implementation: Arc<dyn Handler>) {
        let (module_path, export) = handler.rsplit_once('.').unwrap_or((handler, "handler"));
        let export = export.to_string();
        let existing = self.modules.get(&normalize(module_path)).map(|f| f.clone());
        self.register_module(module_path, move || {
            let base = existing.as_ref().map(|f| f()).unwrap_or_default();
            base.export(export.clone(), implementation.clone())
        });
    }

    pub fn contains(&self, module_path: &str) -> bool {
        self.modules.contains_key(&normalize(module_path))
    }

    pub fn instantiate(&self, module_path: &str) -> Option<HandlerModule> {
        let factory = self.modules.get(&normalize(module_path))?.clone();
        Some(factory())
    }
}

fn normalize(module_path: &str) -> String {
    module_path.trim_start_matches("./").to_string()
}

struct CachedModule {
    module: HandlerModule,
    digest: Option<String>,
}

/// Instantiated modules keyed by resolved file path
pub struct ModuleCache {
    registry: HandlerRegistry,
    policy: ReloadPolicy,
    entries: Mutex<HashMap<PathBuf, CachedModule>>,
}

const MODULE_EXTENSIONS: &[&str] = &["", ".rs", ".js", ".mjs", ".cjs", ".ts", ".py", ".rb"];

impl ModuleCache {
    pub fn new(registry: HandlerRegistry, policy: ReloadPolicy) -> Self {
        Self {
            registry,
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    /// Module for `module_path` relative to `code_dir`, honouring the policy
    pub fn load(&self, code_dir: &Path, module_path: &str) -> Result<HandlerModule, InvocationError> {
        let key = code_dir.join(normalize(module_path));
        let digest = match self.policy {
            ReloadPolicy::OnChange => file_digest(&key),
            ReloadPolicy::Always | ReloadPolicy::Never => None,
        };

        {
            let entries = self.entries.lock();
            if let Some(cached) = entries.get(&key) {
                let reuse = match self.policy {
                    ReloadPolicy::Never => true,
                    ReloadPolicy::Always => false,
                    ReloadPolicy::OnChange => cached.digest == digest,
                };
                if reuse {
                    return Ok(cached.module.clone());
                }
            }
        }

        let module = self.registry.instantiate(module_path).ok_or_else(|| {
            InvocationError::transport(format!(
                "Cannot find handler module '{module_path}' in {}",
                code_dir.display()
            ))
        })?;
        debug!(module = %key.display(), policy = ?self.policy, "Loaded handler module");

        self.entries.lock().insert(
            key,
            CachedModule {
                module: module.clone(),
                digest,
            },
        );
        Ok(module)
    }

    /// Forget every cached module
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// SHA-256 of the first existing candidate file for a module path
fn file_digest(base: &Path) -> Option<String> {
    MODULE_EXTENSIONS.iter().find_map(|ext| {
        let mut candidate = base.as_os_str().to_owned();
        candidate.push(ext);
        let path = PathBuf::from(candidate);
        if !path.is_file() {
            return None;
        }
        let contents = std::fs::read(&path).ok()?;
        Some(hex::encode(Sha256::digest(&contents)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::in_process::sync_handler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_registry(counter: &Arc<AtomicUsize>) -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        let counter = counter.clone();
        registry.register_module("src/handler", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerModule::new().export(
                "hello",
                sync_handler(|_event, ctx| {
                    ctx.succeed("hi");
                    Ok(())
                }),
            )
        });
        registry
    }

    #[test]
    fn test_never_policy_loads_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = ModuleCache::new(counting_registry(&counter), ReloadPolicy::Never);

        cache.load(Path::new("."), "src/handler").unwrap();
        cache.load(Path::new("."), "./src/handler").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_always_policy_reloads() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = ModuleCache::new(counting_registry(&counter), ReloadPolicy::Always);

        cache.load(Path::new("."), "src/handler").unwrap();
        cache.load(Path::new("."), "src/handler").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_on_change_policy_tracks_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let file = dir.path().join("src/handler.rs");
        std::fs::write(&file, "v1").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let cache = ModuleCache::new(counting_registry(&counter), ReloadPolicy::OnChange);

        cache.load(dir.path(), "src/handler").unwrap();
        cache.load(dir.path(), "src/handler").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        std::fs::write(&file, "v2").unwrap();
        cache.load(dir.path(), "src/handler").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_module_is_transport_error() {
        let cache = ModuleCache::new(HandlerRegistry::new(), ReloadPolicy::Never);
        let error = cache.load(Path::new("."), "nowhere").unwrap_err();
        assert!(error.is_transport());
    }

    #[test]
    fn test_register_adds_exports_to_module() {
        let registry = HandlerRegistry::new();
        registry.register("api/users.list", sync_handler(|_, ctx| { ctx.succeed("list"); Ok(()) }));
        registry.register("api/users.get", sync_handler(|_, ctx| { ctx.succeed("get"); Ok(()) }));

        let module = registry.instantiate("api/users").unwrap();
        assert!(module.get("list").is_some());
        assert!(module.get("get").is_some());
        assert!(module.get("delete").is_none());
    }
}
