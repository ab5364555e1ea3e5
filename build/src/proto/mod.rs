//! Wire format of the `kiln.build.v1.ExecutionService`, which runs
//! [crate::executionservice::ProcessDescriptor]s on a remote executor sharing
//! a content store with the caller.
use std::path::PathBuf;
use std::time::Duration;

use kiln_castore::proto::WireDigest;
use kiln_castore::{Digest, DirectoryDigest};

use crate::executionservice::{ExecutionError, ProcessDescriptor, ProcessResult};

mod execution_service;
mod grpc_executionservice_wrapper;

pub use execution_service::{execution_service_client, execution_service_server};
pub use grpc_executionservice_wrapper::GRPCExecutionServiceWrapper;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteRequest {
    #[prost(string, repeated, tag = "1")]
    pub argv: Vec<String>,
    /// Sorted by key.
    #[prost(message, repeated, tag = "2")]
    pub env: Vec<EnvVar>,
    #[prost(message, optional, tag = "3")]
    pub input_root: Option<WireDigest>,
    #[prost(string, tag = "4")]
    pub working_dir: String,
    #[prost(string, repeated, tag = "5")]
    pub output_paths: Vec<String>,
    /// 0 means no timeout.
    #[prost(uint64, tag = "6")]
    pub timeout_ms: u64,
    #[prost(message, optional, tag = "7")]
    pub limits: Option<ResourceLimits>,
    #[prost(string, tag = "8")]
    pub description: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvVar {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ResourceLimits {
    #[prost(uint64, optional, tag = "1")]
    pub memory_bytes: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub cpu_seconds: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteResponse {
    #[prost(int32, tag = "1")]
    pub exit_code: i32,
    #[prost(message, optional, tag = "2")]
    pub stdout: Option<WireDigest>,
    #[prost(message, optional, tag = "3")]
    pub stderr: Option<WireDigest>,
    #[prost(message, optional, tag = "4")]
    pub output_root: Option<WireDigest>,
}

fn parse_digest(field: &str, digest: Option<WireDigest>) -> Result<Digest, ExecutionError> {
    let digest = digest.ok_or_else(|| ExecutionError::InvalidRequest(format!("{field} missing")))?;
    Digest::try_from(digest).map_err(|e| ExecutionError::InvalidRequest(format!("{field}: {e}")))
}

impl From<ProcessDescriptor> for ExecuteRequest {
    fn from(value: ProcessDescriptor) -> Self {
        Self {
            argv: value.argv,
            env: value
                .env
                .into_iter()
                .map(|(key, value)| EnvVar { key, value })
                .collect(),
            input_root: Some(value.input_root.as_digest().into()),
            working_dir: value.working_dir.to_string_lossy().into_owned(),
            output_paths: value
                .output_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            timeout_ms: value.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            limits: Some(ResourceLimits {
                memory_bytes: value.limits.memory_bytes,
                cpu_seconds: value.limits.cpu_seconds,
            }),
            description: value.description,
        }
    }
}

impl TryFrom<ExecuteRequest> for ProcessDescriptor {
    type Error = ExecutionError;

    /// Parses and validates a request received over the wire.
    fn try_from(value: ExecuteRequest) -> Result<Self, Self::Error> {
        if !value.env.windows(2).all(|w| w[0].key < w[1].key) {
            return Err(ExecutionError::InvalidRequest(
                "env not sorted by key".into(),
            ));
        }

        let limits = value.limits.unwrap_or_default();
        let descriptor = ProcessDescriptor {
            argv: value.argv,
            env: value.env.into_iter().map(|e| (e.key, e.value)).collect(),
            input_root: DirectoryDigest::new(parse_digest("input_root", value.input_root)?),
            working_dir: PathBuf::from(value.working_dir),
            output_paths: value.output_paths.into_iter().map(PathBuf::from).collect(),
            timeout: match value.timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            limits: crate::executionservice::ResourceLimits {
                memory_bytes: limits.memory_bytes,
                cpu_seconds: limits.cpu_seconds,
            },
            description: value.description,
        };

        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl From<ProcessResult> for ExecuteResponse {
    fn from(value: ProcessResult) -> Self {
        Self {
            exit_code: value.exit_code,
            stdout: Some((&value.stdout).into()),
            stderr: Some((&value.stderr).into()),
            output_root: Some(value.output_root.as_digest().into()),
        }
    }
}

impl TryFrom<ExecuteResponse> for ProcessResult {
    type Error = ExecutionError;

    fn try_from(value: ExecuteResponse) -> Result<Self, Self::Error> {
        Ok(Self {
            exit_code: value.exit_code,
            stdout: parse_digest("stdout", value.stdout)?,
            stderr: parse_digest("stderr", value.stderr)?,
            output_root: DirectoryDigest::new(parse_digest("output_root", value.output_root)?),
        })
    }
}
