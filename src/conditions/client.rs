use super::frame::{FrameError, read_frame, write_frame};
use super::{ArchiveError, ArchiveRequest, ArchiveResponse, ConditionsArchive, SignalKind};
use crate::config::{ArchivePolicy, RetryPolicy};
use crate::core::{ConditionsValueSet, TimeWindow};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{Duration, sleep, timeout};
use tracing::{Level, event};

/// TCP client for the slow-control archive.
///
/// One connection per request. Transport failures are retried up to
/// `policy.max_retries` times with exponential backoff; a rejection from the
/// server is returned immediately.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    policy: ArchivePolicy,
    backoff: RetryPolicy,
}

impl ArchiveClient {
    pub fn new(policy: ArchivePolicy, backoff: RetryPolicy) -> Self {
        Self { policy, backoff }
    }

    async fn exchange(
        &self,
        address: &str,
        request: &ArchiveRequest,
    ) -> Result<ArchiveResponse, String> {
        let connect = TcpStream::connect(address);
        let mut stream = timeout(Duration::from_millis(self.policy.connect_timeout_ms), connect)
            .await
            .map_err(|_| format!("connect timed out after {}ms", self.policy.connect_timeout_ms))?
            .map_err(|err| format!("connect: {}", err))?;

        let round_trip = async {
            write_frame(&mut stream, request).await?;
            read_frame::<_, ArchiveResponse>(&mut stream).await
        };

        timeout(Duration::from_millis(self.policy.request_timeout_ms), round_trip)
            .await
            .map_err(|_| format!("request timed out after {}ms", self.policy.request_timeout_ms))?
            .map_err(|err: FrameError| err.to_string())
    }
}

#[async_trait]
impl ConditionsArchive for ArchiveClient {
    async fn fetch(
        &self,
        host: &str,
        port: u16,
        signal: &str,
        kind: SignalKind,
        window: &TimeWindow,
    ) -> Result<ConditionsValueSet, ArchiveError> {
        let address = format!("{}:{}", host, port);
        let request = ArchiveRequest {
            signal: signal.to_string(),
            kind,
            from: window.start,
            to: window.end,
        };

        let attempts = self.policy.max_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.exchange(&address, &request).await {
                Ok(ArchiveResponse::Values(samples)) => {
                    event!(
                        Level::DEBUG,
                        signal,
                        samples = samples.len(),
                        "archive signal retrieved"
                    );
                    return Ok(ConditionsValueSet::new(signal, samples));
                }
                Ok(ArchiveResponse::Rejected { code, message }) => {
                    return Err(ArchiveError::Rejected {
                        signal: signal.to_string(),
                        code,
                        message,
                    });
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        signal,
                        attempt,
                        address = %address,
                        error = %err,
                        "archive transport failure"
                    );
                    last_error = err;
                    if attempt < attempts {
                        sleep(Duration::from_millis(self.backoff.backoff_ms(attempt))).await;
                    }
                }
            }
        }

        Err(ArchiveError::Transport {
            address,
            message: last_error,
        })
    }
}
