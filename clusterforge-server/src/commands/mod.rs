pub mod cluster;
pub mod host;
pub mod server;

use anyhow::Result;
use reqwest::Response;

/// Turn a non-success API response into an error carrying the server's message
pub(crate) async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body["error"].as_str().unwrap_or("no details");
    anyhow::bail!("API error ({}): {}", status, message)
}
