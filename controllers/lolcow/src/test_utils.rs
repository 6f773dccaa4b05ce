//! Test utilities for unit testing the reconciler
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::config::EndpointType;
use crate::reconciler::synthesizer::SynthesisSettings;
use crate::reconciler::Reconciler;
use crate::telemetry::Metrics;
use crds::{Lolcow, LolcowSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_store::MockResourceStore;
use std::sync::Arc;
use std::time::Duration;

/// Helper to create a test Lolcow with a uid
pub fn create_test_lolcow(name: &str, namespace: &str, greeting: &str, port: i32) -> Lolcow {
    Lolcow {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}-{}", namespace, name)),
            ..Default::default()
        },
        spec: LolcowSpec {
            greeting: greeting.to_string(),
            port,
        },
        status: None,
    }
}

/// Synthesis settings used throughout the tests
pub fn test_settings() -> SynthesisSettings {
    SynthesisSettings {
        image: "example.com/lolcow:test".to_string(),
        endpoint_type: EndpointType::NodePort,
    }
}

/// Requeue delay the test reconciler returns after writes
pub const TEST_REQUEUE: Duration = Duration::from_secs(5);

/// Helper to create a Reconciler over a mock store
pub fn create_test_reconciler(store: &MockResourceStore) -> Reconciler {
    Reconciler::new(
        Arc::new(store.clone()),
        test_settings(),
        TEST_REQUEUE,
        Arc::new(Metrics::new().unwrap()),
    )
}
