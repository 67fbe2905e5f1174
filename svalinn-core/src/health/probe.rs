//! Probe transport abstraction
//!
//! The monitor only cares about "what status code came back, and how long
//! did it take". Implementations supply the transport, which keeps the
//! monitor testable without sockets.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by a probe implementation
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<u16, String>> + Send + 'a>>;

/// Transport used to check one endpoint. Returns the HTTP status code, or
/// a message when no response arrived at all.
pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, url: &'a str) -> ProbeFuture<'a>;
}

/// Probe over a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Build a probe with its own request timeout
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Reuse an existing client (connection pools, proxies, TLS config)
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, url: &'a str) -> ProbeFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            Ok(response.status().as_u16())
        })
    }
}
