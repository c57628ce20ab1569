//! 输出 Foo 的 CustomResourceDefinition
//!
//! ```sh
//! cargo run --bin crdgen > foo-crd.yaml
//! ```

use anyhow::Result;
use kube::CustomResourceExt;
use sample_operator::crd::Foo;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Foo::crd())?);
    Ok(())
}
