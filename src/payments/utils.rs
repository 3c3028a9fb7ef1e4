use crate::payments::error::{PaymentError, PaymentResult};
use md5::{Digest, Md5};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha1::Sha1;
use std::time::Duration;
use tracing::warn;

/// JSON-over-HTTP client with bounded retries on 429/5xx/network errors.
/// Shared by the commerce backend and the Click fiscal client.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
    provider: &'static str,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
            provider,
        })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.request(method.clone(), url).timeout(self.timeout);
            for (name, value) in additional_headers {
                request = request.header(*name, *value);
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let failure = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok());
                    let text = resp.text().await.unwrap_or_default();

                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::ProviderError {
                                provider: self.provider.to_string(),
                                message: format!("invalid JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        PaymentError::RateLimitError {
                            message: format!("{} rate limit exceeded", self.provider),
                            retry_after_seconds: retry_after,
                        }
                    } else {
                        PaymentError::ProviderError {
                            provider: self.provider.to_string(),
                            message: format!("HTTP {}: {}", status, text),
                            provider_code: Some(status.as_u16().to_string()),
                            retryable: status.is_server_error(),
                        }
                    }
                }
                Err(e) => PaymentError::NetworkError {
                    message: format!("{} request failed: {}", self.provider, e),
                },
            };

            if !failure.is_retryable() || attempt >= self.max_retries {
                return Err(failure);
            }
            attempt += 1;
            let delay = match &failure {
                PaymentError::RateLimitError {
                    retry_after_seconds: Some(secs),
                    ..
                } => Duration::from_secs((*secs).min(MAX_BACKOFF_SECS)),
                _ => backoff(attempt),
            };
            warn!(
                provider = self.provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Outbound request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

const MAX_BACKOFF_SECS: u64 = 8;

/// 1s, 2s, 4s, ... capped.
fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(3);
    Duration::from_secs((1_u64 << exp).min(MAX_BACKOFF_SECS))
}

pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

pub fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(10), Duration::from_secs(8));
    }

    #[test]
    fn digests_match_known_vectors() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
