//! Prints the Lolcow CRD as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/lolcow.yaml`

use anyhow::Result;
use crds::Lolcow;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crd = Lolcow::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
