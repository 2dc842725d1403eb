use reqwest::Response;

use crate::{DispatchError, Result};

/// Turn a non-success response into [`DispatchError::Http`]
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DispatchError::Http {
        status: status.as_u16(),
        body,
    })
}
