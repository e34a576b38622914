//! In-process simulated provider.
//!
//! Objects live in a map keyed by a generated provider identity. Faults can
//! be injected per resource and call kind, every call is logged, and the
//! number of calls in flight at once is tracked.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::model::{ResourceId, Value};
use crate::state::Outputs;

use super::{Created, Provider, ResourceChanges, ResourceSpec};

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// `create_resource`.
    Create,
    /// `update_resource`.
    Update,
    /// `delete_resource`.
    Delete,
    /// `read_resource`.
    Read,
}

/// One logged provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Kind of call.
    pub kind: CallKind,
    /// Resource the call acted on.
    pub resource: ResourceId,
    /// Provider identity involved (assigned one for creates).
    pub provider_id: Option<String>,
}

/// A stored object.
#[derive(Debug, Clone)]
struct Object {
    resource: ResourceId,
    properties: BTreeMap<String, Value>,
}

/// An injected failure.
#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Fails transiently this many more times.
    Transient(u32),
    /// Fails on every call.
    Permanent,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Object>,
    next_id: u64,
    faults: HashMap<(ResourceId, CallKind), Fault>,
    outputs: HashMap<String, Outputs>,
    calls: Vec<ProviderCall>,
}

/// Simulated provider.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a call ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every mutating call take `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reports `outputs` for every object of `resource_type`.
    #[must_use]
    pub fn with_outputs(self, resource_type: &str, outputs: Outputs) -> Self {
        self.lock().outputs.insert(resource_type.to_string(), outputs);
        self
    }

    /// Fails the next `times` calls of `kind` on `resource` transiently.
    pub fn fail_transient(&self, resource: &ResourceId, kind: CallKind, times: u32) {
        self.lock()
            .faults
            .insert((resource.clone(), kind), Fault::Transient(times));
    }

    /// Fails every call of `kind` on `resource` permanently.
    pub fn fail_permanent(&self, resource: &ResourceId, kind: CallKind) {
        self.lock()
            .faults
            .insert((resource.clone(), kind), Fault::Permanent);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Removes an object behind the engine's back.
    pub fn forget(&self, provider_id: &str) -> bool {
        self.lock().objects.remove(provider_id).is_some()
    }

    /// Returns the logged calls.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Returns the number of logged calls of `kind`.
    #[must_use]
    pub fn call_count(&self, kind: CallKind) -> usize {
        self.lock().calls.iter().filter(|c| c.kind == kind).count()
    }

    /// Returns the number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns the provider ids of live objects for `resource`.
    #[must_use]
    pub fn objects_of(&self, resource: &ResourceId) -> Vec<String> {
        self.lock()
            .objects
            .iter()
            .filter(|(_, o)| o.resource == *resource)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the properties an object was last given.
    #[must_use]
    pub fn properties_of(&self, provider_id: &str) -> Option<BTreeMap<String, Value>> {
        self.lock()
            .objects
            .get(provider_id)
            .map(|o| o.properties.clone())
    }

    /// Returns the highest number of calls seen in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a call as started and waits out the latency.
    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        InFlight(&self.in_flight)
    }
}

impl Inner {
    /// Logs a call and applies any injected fault.
    fn record(
        &mut self,
        kind: CallKind,
        resource: &ResourceId,
        provider_id: Option<&str>,
    ) -> ProviderResult<()> {
        self.calls.push(ProviderCall {
            kind,
            resource: resource.clone(),
            provider_id: provider_id.map(ToString::to_string),
        });

        let key = (resource.clone(), kind);
        match self.faults.get_mut(&key) {
            Some(Fault::Permanent) => Err(ProviderError::permanent(format!(
                "injected failure for {resource}"
            ))),
            Some(Fault::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProviderError::transient(format!(
                    "injected transient failure for {resource}"
                )))
            }
            _ => Ok(()),
        }
    }

    fn outputs_for(&self, resource_type: &str) -> Outputs {
        self.outputs.get(resource_type).cloned().unwrap_or_default()
    }

    fn object(&self, provider_id: &str) -> ProviderResult<&Object> {
        self.objects.get(provider_id).ok_or_else(|| ProviderError::NotFound {
            provider_id: provider_id.to_string(),
        })
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create_resource(&self, spec: &ResourceSpec) -> ProviderResult<Created> {
        let _call = self.enter().await;
        let mut inner = self.lock();

        inner.next_id += 1;
        let provider_id = format!("{}-{:04}", spec.id.resource_type, inner.next_id);
        inner.record(CallKind::Create, &spec.id, Some(&provider_id))?;

        inner.objects.insert(
            provider_id.clone(),
            Object {
                resource: spec.id.clone(),
                properties: spec.properties.clone(),
            },
        );
        debug!("Simulated create of {} as {provider_id}", spec.id);

        Ok(Created {
            outputs: inner.outputs_for(&spec.id.resource_type),
            provider_id,
        })
    }

    async fn update_resource(
        &self,
        provider_id: &str,
        changes: &ResourceChanges,
    ) -> ProviderResult<Outputs> {
        let _call = self.enter().await;
        let mut inner = self.lock();

        inner.object(provider_id)?;
        inner.record(CallKind::Update, &changes.id, Some(provider_id))?;

        if let Some(object) = inner.objects.get_mut(provider_id) {
            object.properties.clone_from(&changes.properties);
        }
        Ok(inner.outputs_for(&changes.id.resource_type))
    }

    async fn delete_resource(&self, _resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        let _call = self.enter().await;
        let mut inner = self.lock();

        let resource = inner.object(provider_id)?.resource.clone();
        inner.record(CallKind::Delete, &resource, Some(provider_id))?;

        inner.objects.remove(provider_id);
        debug!("Simulated delete of {resource} ({provider_id})");
        Ok(())
    }

    async fn read_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> ProviderResult<Option<Outputs>> {
        let mut inner = self.lock();

        let Some(resource) = inner.objects.get(provider_id).map(|o| o.resource.clone()) else {
            return Ok(None);
        };
        inner.record(CallKind::Read, &resource, Some(provider_id))?;
        Ok(Some(inner.outputs_for(resource_type)))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec::new(ResourceId::new("vm", name), BTreeMap::new())
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let mut outputs = Outputs::new();
        outputs.insert(String::from("public_ip"), Value::from("203.0.113.7"));
        let provider = MemoryProvider::new().with_outputs("vm", outputs);

        let created = provider.create_resource(&spec("a")).await.expect("create");
        assert_eq!(created.outputs["public_ip"], Value::from("203.0.113.7"));
        assert_eq!(provider.object_count(), 1);

        let read = provider
            .read_resource("vm", &created.provider_id)
            .await
            .expect("read");
        assert!(read.is_some());

        provider
            .delete_resource("vm", &created.provider_id)
            .await
            .expect("delete");
        assert_eq!(provider.object_count(), 0);

        let err = provider
            .delete_resource("vm", &created.provider_id)
            .await
            .expect_err("already gone");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_transient_fault_clears_after_count() {
        let provider = MemoryProvider::new();
        let id = ResourceId::new("vm", "a");
        provider.fail_transient(&id, CallKind::Create, 2);

        assert!(provider.create_resource(&spec("a")).await.is_err());
        assert!(provider.create_resource(&spec("a")).await.is_err());
        assert!(provider.create_resource(&spec("a")).await.is_ok());
        assert_eq!(provider.call_count(CallKind::Create), 3);
        assert_eq!(provider.object_count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_fault() {
        let provider = MemoryProvider::new();
        provider.fail_permanent(&ResourceId::new("vm", "b"), CallKind::Create);

        let err = provider
            .create_resource(&spec("b"))
            .await
            .expect_err("permanent");
        assert!(!err.is_transient());
        assert!(provider.create_resource(&spec("c")).await.is_ok());
    }
}
