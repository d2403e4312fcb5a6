//! Prints the CustomResourceDefinitions owned by the provider.
//!
//! ```bash
//! crdgen > config/crd/bases/addon.cluster.x-k8s.io.yaml
//! ```

use kube::CustomResourceExt;
use kubewarden_addon_provider::{KubewardenAddon, KubewardenPolicy};

fn main() -> anyhow::Result<()> {
    println!("---");
    print!("{}", serde_yaml::to_string(&KubewardenAddon::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&KubewardenPolicy::crd())?);
    Ok(())
}
