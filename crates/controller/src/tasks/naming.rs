use super::types::RunIdentity;

const MAX_K8S_NAME_LENGTH: usize = 63;
const MAX_DNS_SUBDOMAIN_LENGTH: usize = 253;
const SEPARATORS: &[char] = &['-', '.'];

pub struct ResourceNaming;

impl ResourceNaming {
    /// Generate the backup Job name for a workload/claim pair.
    /// Format: {prefix}-{run seed}-{pod}-{pvc}
    ///
    /// Deterministic for the same inputs so a retried submission hits the existing Job.
    pub fn job_name(prefix: &str, run: &RunIdentity, pod_name: &str, pvc_name: &str) -> String {
        let base_name = format!("{prefix}-{}-{pod_name}-{pvc_name}", run.seed());
        Self::ensure_k8s_name_length(&base_name, MAX_K8S_NAME_LENGTH)
    }

    /// ClusterRoleBinding name for the backup service account of one namespace.
    pub fn role_binding_name(service_account: &str, namespace: &str) -> String {
        Self::ensure_k8s_name_length(
            &format!("{service_account}-{namespace}"),
            MAX_DNS_SUBDOMAIN_LENGTH,
        )
    }

    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        let truncated: String = name.chars().take(limit).collect();
        // Names ending with "-" are invalid for k8s
        truncated.trim_end_matches(SEPARATORS).to_string()
    }
}
