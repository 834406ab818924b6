//! Print the sidelink CustomResourceDefinitions as YAML

use control::apis::crd::{GatewayRouter, L34Route};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&GatewayRouter::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&L34Route::crd())?);
    Ok(())
}
