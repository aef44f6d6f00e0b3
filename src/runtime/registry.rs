//! Name-keyed, versioned handler registries.
//!
//! `Registry<H>` backs both orchestrations and activities. Activities always
//! live at 1.0.0; orchestrations may register several semver versions and
//! choose one per name through a [`VersionPolicy`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use semver::Version;
use serde::{Serialize, de::DeserializeOwned};

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityContext, OrchestrationContext};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// Which registered version new instances of a name start on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

type VersionMap<H> = HashMap<String, BTreeMap<Version, Arc<H>>>;

pub struct Registry<H: ?Sized> {
    inner: Arc<VersionMap<H>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// Manual impl: `H: ?Sized` blocks the derive.
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: VersionMap<H>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn policy_for(&self, name: &str) -> VersionPolicy {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest)
    }

    /// Handler and version new instances of `name` should run.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let versions = self.inner.get(name);
        let found = match self.policy_for(name) {
            VersionPolicy::Latest => versions
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions.and_then(|m| m.get(&v)).map(|h| (v, Arc::clone(h))),
        };
        if found.is_none() {
            self.log_miss(name, None);
        }
        found
    }

    /// Handler pinned to `version`, as recorded in an instance's history.
    pub fn resolve_handler_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        let found = self.inner.get(name).and_then(|m| m.get(version)).cloned();
        if found.is_none() {
            self.log_miss(name, Some(version));
        }
        found
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_miss(&self, name: &str, requested_version: Option<&Version>) {
        tracing::debug!(
            target: "sagaflow::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            available_versions = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, failing with every registration error joined by `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, what: &str) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors.push(format!("duplicate {what} registration: {name}@{version}"));
            return;
        }
        entry.insert(version, handler);
    }

    fn insert_versioned(&mut self, name: String, version: &str, handler: Arc<H>) {
        let v = match Version::parse(version) {
            Ok(v) => v,
            Err(e) => {
                self.errors
                    .push(format!("invalid version '{version}' for orchestration {name}: {e}"));
                return;
            }
        };
        if let Some(latest) = self.map.get(&name).and_then(|m| m.keys().next_back())
            && &v <= latest
        {
            self.errors.push(format!(
                "non-monotonic orchestration version for {name}: {v} is not later than {latest}"
            ));
            return;
        }
        self.insert(name, v, handler, "orchestration");
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    /// Register with serde_json-decoded input and encoded output.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, raw: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&raw)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }

    /// Register a specific semver version. Versions of a name must be added in increasing order.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_versioned(name.into(), version.as_ref(), Arc::new(FnOrchestration(f)));
        self
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(
        mut self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        f: F,
    ) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, raw: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&raw)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert_versioned(name.into(), version.as_ref(), Arc::new(FnOrchestration(wrapper)));
        self
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, raw: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&raw)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(wrapper)), "activity");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: OrchestrationContext, input: String) -> impl Future<Output = Result<String, String>> + Send {
        async move { Ok(input) }
    }

    #[test]
    fn latest_policy_picks_highest_version() {
        let reg = OrchestrationRegistry::builder()
            .register("Orch", noop)
            .register_versioned("Orch", "2.0.0", noop)
            .build();
        let (v, _) = reg.resolve_handler("Orch").unwrap();
        assert_eq!(v, Version::new(2, 0, 0));
    }

    #[test]
    fn exact_policy_pins_version() {
        let reg = OrchestrationRegistry::builder()
            .register("Orch", noop)
            .register_versioned("Orch", "2.0.0", noop)
            .set_policy("Orch", VersionPolicy::Exact(Version::new(1, 0, 0)))
            .build();
        assert_eq!(reg.resolve_handler("Orch").unwrap().0, Version::new(1, 0, 0));
        assert!(reg.resolve_handler_exact("Orch", &Version::new(3, 0, 0)).is_none());
    }

    #[test]
    fn duplicate_and_invalid_registrations_are_reported() {
        let err = OrchestrationRegistry::builder()
            .register("Orch", noop)
            .register("Orch", noop)
            .register_versioned("Other", "not-semver", noop)
            .build_result()
            .err()
            .unwrap();
        assert!(err.contains("duplicate orchestration registration: Orch@1.0.0"));
        assert!(err.contains("invalid version 'not-semver'"));
    }

    #[test]
    fn activities_resolve_by_name() {
        let reg = ActivityRegistry::builder()
            .register("Echo", |_ctx: ActivityContext, input: String| async move { Ok(input) })
            .build();
        assert!(reg.has("Echo"));
        assert!(reg.resolve_handler("Missing").is_none());
    }
}
