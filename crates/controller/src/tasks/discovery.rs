//! Volume discovery
//!
//! Partitions every PersistentVolumeClaim in the cluster into claims mounted by a running
//! pod (eligible for a backup Job on that pod's node) and claims nobody mounts.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::types::{Error, Result};

/// Dedup key for a claim: `<name>:<namespace>`.
pub fn volume_key(name: &str, namespace: &str) -> String {
    format!("{name}:{namespace}")
}

/// A claim together with the running pod that currently mounts it.
#[derive(Debug, Clone)]
pub struct MountedVolume {
    pub pod: Pod,
    pub claim: PersistentVolumeClaim,
}

impl MountedVolume {
    pub fn key(&self) -> String {
        volume_key(&self.claim_name(), &self.namespace())
    }

    pub fn claim_name(&self) -> String {
        self.claim.name_any()
    }

    pub fn pod_name(&self) -> String {
        self.pod.name_any()
    }

    pub fn namespace(&self) -> String {
        self.claim
            .namespace()
            .or_else(|| self.pod.namespace())
            .unwrap_or_else(|| "default".to_string())
    }
}

/// Discovery result. A claim appears in exactly one of the two partitions.
#[derive(Debug, Default)]
pub struct BackupVolumeList {
    /// Keyed by `<pvc name>:<namespace>`; sorted, which fixes dispatch order.
    pub mounted: BTreeMap<String, MountedVolume>,
    pub unmounted: Vec<PersistentVolumeClaim>,
}

/// Read-only view of the cluster used by discovery.
#[async_trait]
pub trait VolumeSource: Send + Sync {
    /// Pods without the given label key.
    async fn list_workloads(&self, excluded_label: &str) -> Result<Vec<Pod>, kube::Error>;

    async fn get_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, kube::Error>;

    async fn list_volumes(&self) -> Result<Vec<PersistentVolumeClaim>, kube::Error>;
}

pub struct KubeVolumeSource {
    client: Client,
}

impl KubeVolumeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VolumeSource for KubeVolumeSource {
    async fn list_workloads(&self, excluded_label: &str) -> Result<Vec<Pod>, kube::Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("!{excluded_label}"));
        Ok(pods.list(&params).await?.items)
    }

    async fn get_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, kube::Error> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        pvcs.get(name).await
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolumeClaim>, kube::Error> {
        let pvcs: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        Ok(pvcs.list(&ListParams::default()).await?.items)
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

/// Names of the claims a pod references through its volumes.
fn claim_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|volume| volume.persistent_volume_claim.as_ref())
                .map(|source| source.claim_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// List all claims and split them into mounted and unmounted ones.
///
/// Pods carrying `ownership_label` belong to backup Jobs and are skipped. Any list or
/// lookup failure aborts discovery; no partial result is returned.
pub async fn list_eligible_volumes(
    source: &dyn VolumeSource,
    ownership_label: &str,
) -> Result<BackupVolumeList> {
    let pods: Vec<Pod> = source
        .list_workloads(ownership_label)
        .await?
        .into_iter()
        .filter(|pod| !pod.labels().contains_key(ownership_label))
        .filter(|pod| is_running(pod) && !claim_names(pod).is_empty())
        .collect();

    let mut backup_list = BackupVolumeList::default();

    for pod in pods {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        for claim_name in claim_names(&pod) {
            let claim = source
                .get_volume(&namespace, &claim_name)
                .await
                .map_err(|source| Error::VolumeLookup {
                    pod: pod.name_any(),
                    claim: claim_name.clone(),
                    source,
                })?;
            let mounted = MountedVolume {
                pod: pod.clone(),
                claim,
            };
            debug!(
                pod = %mounted.pod_name(),
                pvc = %mounted.claim_name(),
                namespace = %namespace,
                "found pod and pvc"
            );
            // Last writer wins; every pod mounting the same claim resolves it identically.
            backup_list.mounted.insert(mounted.key(), mounted);
        }
    }

    for claim in source.list_volumes().await? {
        let namespace = claim.namespace().unwrap_or_else(|| "default".to_string());
        let key = volume_key(&claim.name_any(), &namespace);
        if !backup_list.mounted.contains_key(&key) {
            debug!(pvc = %claim.name_any(), namespace = %namespace, "found unmounted pvc");
            backup_list.unmounted.push(claim);
        }
    }

    info!(
        mounted = backup_list.mounted.len(),
        unmounted = backup_list.unmounted.len(),
        "volume discovery finished"
    );

    Ok(backup_list)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use serde_json::json;
    use std::collections::{BTreeMap, HashSet};

    pub(crate) fn pod(namespace: &str, name: &str, phase: &str, claims: &[&str]) -> Pod {
        let volumes: Vec<_> = claims
            .iter()
            .map(|claim| json!({"name": claim, "persistentVolumeClaim": {"claimName": claim}}))
            .collect();
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": namespace, "labels": {"app": name}},
            "spec": {"containers": [{"name": "main", "image": "busybox"}], "volumes": volumes},
            "status": {"phase": phase}
        }))
        .unwrap()
    }

    pub(crate) fn claim(namespace: &str, name: &str) -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": namespace}
        }))
        .unwrap()
    }

    #[derive(Default)]
    pub(crate) struct FakeVolumeSource {
        pub pods: Vec<Pod>,
        pub claims: Vec<PersistentVolumeClaim>,
        pub fail_listing: bool,
    }

    fn not_found(name: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("persistentvolumeclaims \"{name}\" not found"),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    #[async_trait]
    impl VolumeSource for FakeVolumeSource {
        async fn list_workloads(&self, _excluded_label: &str) -> Result<Vec<Pod>, kube::Error> {
            if self.fail_listing {
                return Err(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "forbidden".to_string(),
                    reason: "Forbidden".to_string(),
                    code: 403,
                }));
            }
            Ok(self.pods.clone())
        }

        async fn get_volume(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<PersistentVolumeClaim, kube::Error> {
            self.claims
                .iter()
                .find(|c| c.name_any() == name && c.namespace().as_deref() == Some(namespace))
                .cloned()
                .ok_or_else(|| not_found(name))
        }

        async fn list_volumes(&self) -> Result<Vec<PersistentVolumeClaim>, kube::Error> {
            Ok(self.claims.clone())
        }
    }

    #[tokio::test]
    async fn partitions_claims_into_mounted_and_unmounted() {
        let source = FakeVolumeSource {
            pods: vec![
                pod("shop", "db-0", "Running", &["data"]),
                pod("shop", "web", "Running", &[]),
                pod("shop", "batch", "Succeeded", &["scratch"]),
            ],
            claims: vec![
                claim("shop", "data"),
                claim("shop", "scratch"),
                claim("blog", "data"),
            ],
            ..FakeVolumeSource::default()
        };

        let list = list_eligible_volumes(&source, "backup.cto.dev/run-id")
            .await
            .unwrap();

        let mounted: Vec<_> = list.mounted.keys().cloned().collect();
        assert_eq!(mounted, vec!["data:shop".to_string()]);
        assert_eq!(list.mounted["data:shop"].pod_name(), "db-0");

        let mut unmounted: Vec<_> = list
            .unmounted
            .iter()
            .map(|c| volume_key(&c.name_any(), &c.namespace().unwrap()))
            .collect();
        unmounted.sort();
        assert_eq!(unmounted, vec!["data:blog", "scratch:shop"]);
    }

    #[tokio::test]
    async fn every_claim_lands_in_exactly_one_partition() {
        let source = FakeVolumeSource {
            pods: vec![
                pod("a", "one", "Running", &["x", "y"]),
                pod("a", "two", "Running", &["y"]),
                pod("b", "three", "Pending", &["z"]),
            ],
            claims: vec![claim("a", "x"), claim("a", "y"), claim("b", "z"), claim("b", "x")],
            ..FakeVolumeSource::default()
        };

        let list = list_eligible_volumes(&source, "owner").await.unwrap();

        let mut seen = HashSet::new();
        for key in list.mounted.keys() {
            assert!(seen.insert(key.clone()), "duplicate {key}");
        }
        for claim in &list.unmounted {
            let key = volume_key(&claim.name_any(), &claim.namespace().unwrap());
            assert!(seen.insert(key.clone()), "duplicate {key}");
        }
        assert_eq!(seen.len(), source.claims.len());
        // "y" is mounted twice; the later pod wins
        assert_eq!(list.mounted["y:a"].pod_name(), "two");
    }

    #[tokio::test]
    async fn skips_backup_job_pods() {
        let mut job_pod = pod("a", "backup-abc-one-x", "Running", &["x"]);
        job_pod.metadata.labels = Some(BTreeMap::from([(
            "owner".to_string(),
            "some-run".to_string(),
        )]));
        let source = FakeVolumeSource {
            pods: vec![job_pod],
            claims: vec![claim("a", "x")],
            ..FakeVolumeSource::default()
        };

        let list = list_eligible_volumes(&source, "owner").await.unwrap();
        assert!(list.mounted.is_empty());
        assert_eq!(list.unmounted.len(), 1);
    }

    #[tokio::test]
    async fn missing_claim_aborts_discovery() {
        let source = FakeVolumeSource {
            pods: vec![pod("a", "one", "Running", &["ghost"])],
            ..FakeVolumeSource::default()
        };

        let err = list_eligible_volumes(&source, "owner").await.unwrap_err();
        match err {
            Error::VolumeLookup { pod, claim, .. } => {
                assert_eq!(pod, "one");
                assert_eq!(claim, "ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn list_failure_propagates() {
        let source = FakeVolumeSource {
            fail_listing: true,
            ..FakeVolumeSource::default()
        };
        assert!(matches!(
            list_eligible_volumes(&source, "owner").await,
            Err(Error::KubeError(_))
        ));
    }
}
