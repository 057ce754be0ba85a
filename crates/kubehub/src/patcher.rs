use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kstatus_core::{ConditionSet, PatchKind, Patcher, TargetIdentity};
use kube::{
    api::{Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    Api, Client,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

use crate::{dynamic_api, owned_conditions};

/// Writes the status subresource of one resource kind.
#[derive(Clone)]
pub struct KubePatcher {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubePatcher {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self { Self { client, ar, namespaced } }

    fn api(&self, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        if self.namespaced && namespace.is_none() {
            return Err(anyhow!("namespace required for namespaced kind {}", self.ar.kind));
        }
        Ok(dynamic_api(self.client.clone(), &self.ar, self.namespaced, namespace))
    }

    /// Conditions `field_manager` currently owns on the live target. Read fresh on every call.
    pub async fn persisted(&self, target: &TargetIdentity, field_manager: &str) -> Result<ConditionSet> {
        let api = self.api(target.namespace.as_deref())?;
        let live = api.get_opt(&target.name).await.with_context(|| format!("fetching {}", target.key()))?;
        Ok(live.map(|obj| owned_conditions(&obj, field_manager)).unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl Patcher for KubePatcher {
    async fn apply_status(&self, name: &str, namespace: Option<&str>, kind: PatchKind, body: &Json, field_manager: &str) -> Result<()> {
        let t0 = Instant::now();
        let api = self.api(namespace)?;
        let res = match kind {
            PatchKind::Apply => {
                let pp = PatchParams::apply(field_manager).force();
                api.patch_status(name, &pp, &Patch::Apply(body)).await
            }
            PatchKind::Merge => {
                let pp = PatchParams { field_manager: Some(field_manager.to_string()), ..Default::default() };
                api.patch_status(name, &pp, &Patch::Merge(body)).await
            }
        };
        histogram!("kstatus_kube_patch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(obj) => {
                debug!(name, ns = ?namespace, %kind, field_manager, rv = ?obj.metadata.resource_version, "status patched");
                Ok(())
            }
            Err(e) => {
                counter!("kstatus_kube_patch_err_total", 1u64, "kind" => self.ar.kind.clone());
                Err(anyhow!("status {} patch of {}/{} failed: {}", kind, self.ar.kind, name, e))
            }
        }
    }
}
