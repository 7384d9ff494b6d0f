use std::time::Duration;

pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

use corral_types::AgentSessionSpec;

/// The default interval for requeuing a managed resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "corral-operator";

pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Hash of the fields that shape the worker, excluding the two
/// post-create mutation markers: flipping `cancel` or recording an
/// approval must never read as pod-spec divergence.
pub fn session_spec_hash(spec: &AgentSessionSpec) -> String {
    let projection = serde_json::json!({
        "prompt": spec.prompt,
        "model": spec.model,
        "workflow": spec.workflow,
        "repos": spec.repos,
        "integrations": spec.integrations,
        "timeoutSeconds": spec.timeout_seconds,
        "userContext": spec.user_context,
    });
    hash_spec(&projection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_types::{ApprovalChoice, ApprovalDecision};

    #[test]
    fn mutation_markers_do_not_change_the_spec_hash() {
        let mut spec = AgentSessionSpec {
            prompt: "fix the typo".to_string(),
            model: "model-x".to_string(),
            ..Default::default()
        };
        let before = session_spec_hash(&spec);
        spec.cancel = true;
        spec.approval = Some(ApprovalDecision {
            decision: ApprovalChoice::Allow,
            payload: None,
            request_id: Some("req-1".to_string()),
        });
        assert_eq!(session_spec_hash(&spec), before);
    }

    #[test]
    fn material_fields_change_the_spec_hash() {
        let spec = AgentSessionSpec {
            prompt: "fix the typo".to_string(),
            model: "model-x".to_string(),
            ..Default::default()
        };
        let before = session_spec_hash(&spec);
        let changed = AgentSessionSpec {
            model: "model-y".to_string(),
            ..spec
        };
        assert_ne!(session_spec_hash(&changed), before);
    }
}
