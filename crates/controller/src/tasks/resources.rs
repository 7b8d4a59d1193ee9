use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

use super::config::{BackupConfig, JobTemplateConfig, RepositoryConfig};
use super::discovery::MountedVolume;
use super::dispatch::{SubmitOutcome, TaskSubmitter};
use super::naming::ResourceNaming;
use super::types::{is_already_exists, Result, RunIdentity};

/// Name of the pod volume carrying the claim to back up.
const DATA_VOLUME_NAME: &str = "data";

/// Builds the manifests one backup run creates.
pub struct BackupResourceBuilder<'a> {
    run: &'a RunIdentity,
    ownership_label: &'a str,
    job: &'a JobTemplateConfig,
    repository: &'a RepositoryConfig,
}

impl<'a> BackupResourceBuilder<'a> {
    pub fn new(run: &'a RunIdentity, config: &'a BackupConfig) -> Self {
        Self {
            run,
            ownership_label: &config.ownership_label,
            job: &config.job,
            repository: &config.repository,
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.ownership_label.to_string(), self.run.to_string())])
    }

    /// Path the claim is mounted at inside the backup container.
    pub fn mount_path(&self, claim_name: &str) -> String {
        format!("{}/{claim_name}", self.job.data_root.trim_end_matches('/'))
    }

    /// Job that snapshots `volume` on the node of the pod currently mounting it.
    pub fn build_job(&self, job_name: &str, volume: &MountedVolume) -> Result<Job> {
        let claim_name = volume.claim_name();
        let namespace = volume.namespace();
        let mount_path = self.mount_path(&claim_name);
        let labels = self.labels();
        // Pin to the workload's node so ReadWriteOnce claims can be attached
        let affinity_labels = volume.pod.labels().clone();

        let env = [
            ("AWS_ACCESS_KEY_ID", &self.repository.access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &self.repository.secret_access_key),
            ("BACKUP_ENCRYPTION_PASSWORD", &self.repository.encryption_password),
            ("BACKUP_BUCKET", &self.repository.bucket),
            ("BACKUP_ENDPOINT", &self.repository.endpoint),
        ]
        .into_iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect::<Vec<_>>();

        let job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name,
                "namespace": namespace,
                "labels": labels
            },
            "spec": {
                "template": {
                    "metadata": {
                        "labels": labels
                    },
                    "spec": {
                        "serviceAccountName": self.job.service_account_name,
                        "restartPolicy": "OnFailure",
                        "affinity": {
                            "podAffinity": {
                                "requiredDuringSchedulingIgnoredDuringExecution": [{
                                    "labelSelector": {
                                        "matchLabels": affinity_labels
                                    },
                                    "topologyKey": "kubernetes.io/hostname"
                                }]
                            }
                        },
                        "containers": [{
                            "name": self.job.container_name,
                            "image": self.job.image.reference(),
                            "args": [
                                "snapshot",
                                "backup",
                                "--path",
                                mount_path,
                                "--hostname",
                                namespace
                            ],
                            "env": env,
                            "volumeMounts": [{
                                "name": DATA_VOLUME_NAME,
                                "mountPath": mount_path
                            }]
                        }],
                        "volumes": [{
                            "name": DATA_VOLUME_NAME,
                            "persistentVolumeClaim": {
                                "claimName": claim_name
                            }
                        }]
                    }
                }
            }
        });

        Ok(serde_json::from_value(job)?)
    }

    pub fn build_service_account(&self, namespace: &str) -> Result<ServiceAccount> {
        Ok(serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {
                "name": self.job.service_account_name,
                "namespace": namespace
            }
        }))?)
    }

    /// Binds the namespace's backup service account to the configured cluster role.
    pub fn build_role_binding(&self, namespace: &str) -> Result<ClusterRoleBinding> {
        let name = ResourceNaming::role_binding_name(&self.job.service_account_name, namespace);
        Ok(serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {
                "name": name
            },
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": self.job.cluster_role_name
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": self.job.service_account_name,
                "namespace": namespace
            }]
        }))?)
    }
}

/// Submits backup resources to the API server.
pub struct KubeTaskSubmitter {
    client: Client,
    run: RunIdentity,
    config: BackupConfig,
}

impl KubeTaskSubmitter {
    pub fn new(client: Client, run: RunIdentity, config: BackupConfig) -> Self {
        Self {
            client,
            run,
            config,
        }
    }

    fn builder(&self) -> BackupResourceBuilder<'_> {
        BackupResourceBuilder::new(&self.run, &self.config)
    }
}

/// Create `object`, treating "already exists" as success.
async fn create_idempotent<K>(api: &Api<K>, object: &K) -> Result<SubmitOutcome>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(SubmitOutcome::Created),
        Err(e) if is_already_exists(&e) => Ok(SubmitOutcome::AlreadyExists),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl TaskSubmitter for KubeTaskSubmitter {
    async fn ensure_service_account(&self, namespace: &str) -> Result<()> {
        let builder = self.builder();

        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = builder.build_service_account(namespace)?;
        if create_idempotent(&accounts, &account).await? == SubmitOutcome::Created {
            info!(namespace = %namespace, name = %account.name_any(), "created backup service account");
        }

        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let binding = builder.build_role_binding(namespace)?;
        match create_idempotent(&bindings, &binding).await? {
            SubmitOutcome::Created => {
                info!(namespace = %namespace, name = %binding.name_any(), "created backup role binding");
            }
            SubmitOutcome::AlreadyExists => {
                debug!(namespace = %namespace, "backup role binding already exists");
            }
        }
        Ok(())
    }

    async fn submit(&self, task_name: &str, volume: &MountedVolume) -> Result<SubmitOutcome> {
        let job = self.builder().build_job(task_name, volume)?;
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &volume.namespace());
        let outcome = create_idempotent(&jobs, &job).await?;
        if outcome == SubmitOutcome::Created {
            info!(job = %task_name, namespace = %volume.namespace(), "created backup job");
        }
        Ok(outcome)
    }
}
