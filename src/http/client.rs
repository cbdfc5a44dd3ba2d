use crate::cache::{FetchError, Request, Response};
use crate::config::Config;
use color_eyre::{eyre::eyre, Result};

const DEFAULT_USER_AGENT: &str = concat!("freshcache/", env!("CARGO_PKG_VERSION"));

/// Plain HTTP client, no caching.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(config: &Config) -> Result<Self> {
    let user_agent = config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);

    let client = reqwest::Client::builder()
      .user_agent(user_agent)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Perform a request. Any completed exchange is a response, whatever its
  /// status; only transport problems are errors.
  pub async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let transport_error = |message: String| FetchError::Transport {
      url: request.url().to_string(),
      message,
    };

    let method = reqwest::Method::from_bytes(request.method().as_bytes())
      .map_err(|e| transport_error(format!("invalid method {}: {}", request.method(), e)))?;

    let response = self
      .client
      .request(method, request.url().clone())
      .send()
      .await
      .map_err(|e| transport_error(e.to_string()))?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| transport_error(format!("failed to read body: {}", e)))?;

    Ok(Response::new(status, headers, body))
  }
}
