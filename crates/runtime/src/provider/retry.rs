//! Bounded retry of provider transport failures.

use super::{EventStream, Provider, ProviderRequest};
use crate::config::RetryConfig;
use crate::model::ModelError;
use backoff::ExponentialBackoffBuilder;
use tracing::warn;

/// Send a request, retrying transient failures with exponential backoff.
///
/// Only the initial request is retried; once a stream is returned its
/// events are the caller's responsibility.
pub(crate) async fn send_with_retry<P: Provider>(
    provider: &P,
    request: ProviderRequest<'_>,
    config: &RetryConfig,
) -> Result<EventStream, ModelError> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff())
        .with_max_interval(config.max_backoff())
        .with_max_elapsed_time(None)
        .build();

    let max_retries = config.max_retries;
    let mut attempt = 0u32;
    backoff::future::retry(policy, || {
        attempt += 1;
        let current = attempt;
        async move {
            provider.send(request).await.map_err(|err| {
                if err.is_transient() && current <= max_retries {
                    warn!(attempt = current, error = %err, "provider request failed, retrying");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        }
    })
    .await
}
