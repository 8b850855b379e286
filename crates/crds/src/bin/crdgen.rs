//! Prints the NetworkNodeState CRD as YAML for `kubectl apply -f -`.

use crds::NetworkNodeState;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&NetworkNodeState::crd())?);
    Ok(())
}
