//! The scoring function seen as an async black box.

mod heuristic;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::text::Signature;

pub use heuristic::HeuristicEstimator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub is_valid: bool,
    pub value: Option<f64>,
    pub confidence: Option<f64>,
    pub signature_inputs: Signature,
}

/// Must be callable concurrently for different inputs. Failures surface as
/// `Err`; rejected input is an `Ok` with `is_valid == false`.
#[async_trait]
pub trait Estimator: Send + Sync {
    async fn estimate(&self, text: &str) -> Result<Estimate>;
}
