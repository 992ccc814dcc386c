//! Live verification against a real EKS stack
//!
//! Provisions real AWS resources and costs money. Ignored by default:
//!
//! ```bash
//! STACKVERIFY_HARNESS=demos/eks-postgres.yaml cargo test --test eks -- --ignored --nocapture
//! ```
//!
//! Requires terraform, the aws CLI with credentials, and a kubeconfig
//! context for the cluster the stack creates.

use std::path::PathBuf;

use stackverify::config::HarnessConfig;
use stackverify::pipeline::Pipeline;

fn harness_path() -> PathBuf {
    std::env::var("STACKVERIFY_HARNESS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/eks-postgres.yaml")
        })
}

/// Story: the postgres-security stack comes up as declared on EKS and is
/// destroyed afterwards
#[tokio::test]
#[ignore]
async fn story_eks_postgres_stack_verifies_and_tears_down() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stackverify=debug")
        .with_test_writer()
        .try_init();

    let config = HarnessConfig::load(&harness_path()).unwrap();
    let pipeline = Pipeline::for_harness(&config).unwrap();

    let outcome = pipeline.run(&config).await;
    println!("{}", outcome);

    assert!(
        outcome.teardown.is_completed(),
        "teardown failed, check for orphaned resources: {outcome}"
    );
    assert!(outcome.passed(), "{outcome}");
}
