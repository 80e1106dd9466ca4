//! Audit sinks for concluded records

pub mod git;

use async_trait::async_trait;

use crate::errors::DeployerError;
use crate::models::record::DeploymentRecord;

/// Receives every concluded record. Failures are reported as warnings and never
/// change the outcome of the operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_deployment(&self, record: &DeploymentRecord) -> Result<(), DeployerError>;
}

/// Sink that drops records
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record_deployment(&self, _record: &DeploymentRecord) -> Result<(), DeployerError> {
        Ok(())
    }
}
