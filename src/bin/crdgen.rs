use kube::CustomResourceExt;

use consist_k8s::crd::WorkSet;

fn main() {
    print!("{}", serde_yaml::to_string(&WorkSet::crd()).unwrap());
}
