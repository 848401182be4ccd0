use crate::error::{GridError, Result};

/// Public echo service returning the caller's address as a bare string.
pub const DEFAULT_ECHO_ENDPOINT: &str = "https://api.ipify.org";

/// Discover this machine's public IP by asking an external echo endpoint.
/// The trimmed response body is used verbatim as the worker's identity.
pub async fn discover_public_ip(endpoint: &str) -> Result<String> {
    let body = reqwest::get(endpoint)
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| GridError::Transport(format!("ip discovery failed: {e}")))?
        .text()
        .await
        .map_err(|e| GridError::Transport(format!("ip discovery failed: {e}")))?;

    let ip = body.trim().to_string();
    if ip.is_empty() {
        return Err(GridError::Transport(
            "ip discovery returned an empty body".to_string(),
        ));
    }
    Ok(ip)
}
