use tonic::async_trait;
use tracing::{instrument, warn};

use super::{ExecuteRequest, ExecuteResponse};
use crate::executionservice::{ExecutionService, ProcessDescriptor};

/// Implements the gRPC server trait ([crate::proto::execution_service_server::ExecutionService])
/// for anything implementing [ExecutionService].
pub struct GRPCExecutionServiceWrapper<E> {
    inner: E,
}

impl<E> GRPCExecutionServiceWrapper<E> {
    pub fn new(execution_service: E) -> Self {
        Self {
            inner: execution_service,
        }
    }
}

#[async_trait]
impl<E> crate::proto::execution_service_server::ExecutionService for GRPCExecutionServiceWrapper<E>
where
    E: ExecutionService + 'static,
{
    #[instrument(skip_all, err)]
    async fn execute(
        &self,
        request: tonic::Request<ExecuteRequest>,
    ) -> Result<tonic::Response<ExecuteResponse>, tonic::Status> {
        let descriptor = ProcessDescriptor::try_from(request.into_inner())?;

        match self.inner.execute(descriptor).await {
            Ok(result) => Ok(tonic::Response::new(result.into())),
            Err(e) => {
                warn!(err=%e, "execution failed");
                Err(e.into())
            }
        }
    }
}
