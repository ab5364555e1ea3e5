use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tonic::{async_trait, transport::Channel, Code, Status};
use tracing::{instrument, warn};

use super::{ExecutionError, ExecutionService, ProcessDescriptor, ProcessResult};
use crate::proto::{
    execution_service_client::ExecutionServiceClient, ExecuteRequest, ExecuteResponse,
};

/// Extra time granted to a remote executor on top of the process timeout,
/// covering materialization and output capture.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

const DEFAULT_MAX_RETRIES: usize = 5;

/// Forwards processes to a remote `kiln.build.v1.ExecutionService`.
///
/// The remote side must share the content store with the caller, as only
/// digests travel over the wire. Requests failing with
/// [Code::Unavailable] are retried with exponential backoff.
pub struct GRPCExecutionService {
    client: ExecutionServiceClient<Channel>,
    grace_period: Duration,
    max_retries: usize,
}

impl GRPCExecutionService {
    pub fn from_client(client: ExecutionServiceClient<Channel>) -> Self {
        Self {
            client,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn execute_with_retries(
        &self,
        request: ExecuteRequest,
        deadline: Option<Duration>,
    ) -> Result<ExecuteResponse, Status> {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_secs(1))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(
            strategy,
            || {
                let mut client = self.client.clone();
                let mut request = tonic::Request::new(request.clone());
                if let Some(deadline) = deadline {
                    request.set_timeout(deadline);
                }
                async move { client.execute(request).await.map(|r| r.into_inner()) }
            },
            |status: &Status| {
                let retry = status.code() == Code::Unavailable;
                if retry {
                    warn!(err=%status, "remote executor unavailable, retrying");
                }
                retry
            },
        )
        .await
    }
}

#[async_trait]
impl ExecutionService for GRPCExecutionService {
    #[instrument(skip_all, fields(process.description=%descriptor.description), err)]
    async fn execute(&self, descriptor: ProcessDescriptor) -> Result<ProcessResult, ExecutionError> {
        descriptor.validate()?;

        let timeout = descriptor.timeout;
        let deadline = timeout.map(|t| t + self.grace_period);
        let call = self.execute_with_retries(ExecuteRequest::from(descriptor), deadline);

        let response = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, call)
                .await
                .map_err(|_| ExecutionError::Timeout(timeout.unwrap_or_default()))?,
            None => call.await,
        };

        match response {
            Ok(response) => ProcessResult::try_from(response),
            Err(status) if status.code() == Code::DeadlineExceeded => {
                Err(ExecutionError::Timeout(timeout.unwrap_or_default()))
            }
            Err(status) => Err(status.into()),
        }
    }
}
