//! Prints the CRD manifests of this crate as YAML.
//!
//! `cargo run -p crds --bin crdgen > config/crd/widgets.yaml`

use crds::Widget;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Widget::crd())?);
    Ok(())
}
