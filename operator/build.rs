use corral_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/corral.dev_agentsession_crd.yaml",
        serde_yaml::to_string(&AgentSession::crd()).unwrap(),
    )
    .unwrap();
}
