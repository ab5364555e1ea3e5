use tonic::async_trait;

mod cached;
mod error;
mod from_addr;
mod grpc;
mod local;
mod process_descriptor;

pub use self::cached::CachedExecutionService;
pub use self::error::ExecutionError;
pub use self::from_addr::from_addr;
pub use self::grpc::GRPCExecutionService;
pub use self::local::LocalExecutionService;
pub use self::process_descriptor::{
    ProcessDescriptor, ProcessResult, ResourceLimits, ValidateDescriptorError,
};

/// Runs [ProcessDescriptor]s, either on this host or elsewhere.
///
/// Implementations read the input tree from, and write stdout, stderr and
/// the output tree to, a content store shared with the caller.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Runs the described process to completion.
    /// A non-zero exit code is returned as a regular [ProcessResult].
    async fn execute(&self, descriptor: ProcessDescriptor) -> Result<ProcessResult, ExecutionError>;
}

#[async_trait]
impl<A> ExecutionService for A
where
    A: AsRef<dyn ExecutionService> + Send + Sync,
{
    async fn execute(&self, descriptor: ProcessDescriptor) -> Result<ProcessResult, ExecutionError> {
        self.as_ref().execute(descriptor).await
    }
}
