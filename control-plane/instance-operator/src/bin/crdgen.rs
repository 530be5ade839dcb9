use instance_operator::crd::{instance::Instance, run::Run};
use kube::core::CustomResourceExt;

fn main() {
    let docs: Vec<String> = [Instance::crd(), Run::crd()]
        .iter()
        .map(|crd| serde_yaml::to_string(crd).expect("serialize CRD to YAML"))
        .collect();
    println!("{}", docs.join("---\n"));
}
