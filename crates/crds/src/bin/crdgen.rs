//! Prints the Classifier CRD manifest as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/classifier.yaml`

use anyhow::Result;
use crds::Classifier;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crd = Classifier::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
