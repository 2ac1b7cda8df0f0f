use app_controller::crd::Application;
use kube::core::CustomResourceExt;

fn main() {
    let crd = Application::crd();
    let yaml = serde_yaml::to_string(&crd).expect("serialize CRD to YAML");
    println!("{}", yaml);
}
