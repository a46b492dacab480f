//! HTTP transport abstraction.
//!
//! The connection managers only ever need "GET this URL and give me the
//! body". Timeouts are applied by the managers, not the transport, so that
//! a timed-out or aborted call is dropped and its connection released.

use std::future::Future;

use crate::error::{Error, Result};

pub trait Transport: Send + Sync + 'static {
    /// Issue a GET and return the response body of a 2xx reply.
    fn get(&self, url: &str) -> impl Future<Output = Result<String>> + Send;
}

/// A [`reqwest`]-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    inner: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(concat!("comet-sdk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn with_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &str) -> impl Future<Output = Result<String>> + Send {
        let request = self
            .inner
            .get(url)
            .header("V", env!("CARGO_PKG_VERSION"));
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                tracing::debug!(status = status.as_u16(), "request rejected");
                return Err(Error::Http {
                    status: status.as_u16(),
                });
            }
            Ok(response.text().await?)
        }
    }
}
