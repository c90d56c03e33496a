//! Node tests: connectivity and bandwidth

use crate::error::FabricError;
use crate::pool::Fabric;
use crate::protocol::{NodeRequest, NodeResponse};
use bytes::Bytes;
use fleetstore_common::types::NodeId;
use rand::RngCore;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TestState {
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct TestResult {
    pub peer: NodeId,
    pub state: TestState,
    pub elapsed: Duration,
    /// Echoed bytes per second, for bandwidth tests
    pub bytes_per_sec: Option<f64>,
    pub error: Option<String>,
}

impl TestResult {
    fn failed(peer: NodeId, elapsed: Duration, error: &FabricError) -> Self {
        Self {
            peer,
            state: TestState::Failed,
            elapsed,
            bytes_per_sec: None,
            error: Some(error.to_string()),
        }
    }
}

/// Round-trip latency of one ping
pub async fn connectivity_test(fabric: &Fabric, peer: NodeId) -> TestResult {
    let started = Instant::now();
    match fabric.send(peer, NodeRequest::Ping).await {
        Ok(NodeResponse::Pong) => {
            let elapsed = started.elapsed();
            info!(peer = %peer, elapsed_ms = elapsed.as_millis() as u64, "connectivity test passed");
            TestResult {
                peer,
                state: TestState::Completed,
                elapsed,
                bytes_per_sec: None,
                error: None,
            }
        }
        Ok(other) => TestResult::failed(
            peer,
            started.elapsed(),
            &FabricError::UnexpectedResponse(format!("{other:?}")),
        ),
        Err(e) => {
            warn!(peer = %peer, error = %e, "connectivity test failed");
            TestResult::failed(peer, started.elapsed(), &e)
        }
    }
}

/// Time an echo of `size` random bytes through the peer
pub async fn bandwidth_test(fabric: &Fabric, peer: NodeId, size: usize) -> TestResult {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    let payload = Bytes::from(payload);

    let started = Instant::now();
    let result = fabric
        .send(
            peer,
            NodeRequest::SelfTest {
                payload: payload.clone(),
            },
        )
        .await;
    let elapsed = started.elapsed();
    match result {
        Ok(NodeResponse::SelfTest { payload: echoed }) if echoed == payload => {
            // both directions carried the payload
            let secs = elapsed.as_secs_f64().max(f64::EPSILON);
            let bytes_per_sec = (size as f64 * 2.0) / secs;
            info!(peer = %peer, size, bytes_per_sec, "bandwidth test passed");
            TestResult {
                peer,
                state: TestState::Completed,
                elapsed,
                bytes_per_sec: Some(bytes_per_sec),
                error: None,
            }
        }
        Ok(_) => TestResult::failed(
            peer,
            elapsed,
            &FabricError::UnexpectedResponse("self-test payload mismatch".to_string()),
        ),
        Err(e) => {
            warn!(peer = %peer, error = %e, "bandwidth test failed");
            TestResult::failed(peer, elapsed, &e)
        }
    }
}
