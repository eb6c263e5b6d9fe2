use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A timestamp or payload field that could not be understood.
///
/// Recovered locally: the offending event is skipped and the rest of the
/// batch continues.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed {field} {input:?}: {reason}")]
pub struct FormatError {
    pub field: &'static str,
    pub input: String,
    pub reason: String,
}

impl FormatError {
    pub fn new(field: &'static str, input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field,
            input: input.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Timeout, connection failure or 5xx from a source or the store.
    #[error("network error talking to {service}: {detail}")]
    Network { service: &'static str, detail: String },

    /// Expired or invalid credentials. Fatal for the run.
    #[error("{service} rejected credentials (status {status})")]
    Auth { service: &'static str, status: u16 },

    /// The store refused an insert batch; nothing from the call is committed.
    #[error("store rejected batch of {count} events: {detail}")]
    Rejected { count: usize, detail: String },

    #[error("unexpected response from {service}: {detail}")]
    Payload { service: &'static str, detail: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    pub(crate) fn network(service: &'static str, err: reqwest::Error) -> Self {
        Error::Network {
            service,
            detail: err.to_string(),
        }
    }

    /// Maps a non-success HTTP status onto the error taxonomy. Anything that
    /// is neither an auth failure nor a server fault becomes `Payload`.
    pub(crate) fn from_status(
        service: &'static str,
        status: reqwest::StatusCode,
        body: String,
    ) -> Self {
        match status.as_u16() {
            401 | 403 => Error::Auth {
                service,
                status: status.as_u16(),
            },
            code if code >= 500 => Error::Network {
                service,
                detail: format!("status {code}: {body}"),
            },
            code => Error::Payload {
                service,
                detail: format!("status {code}: {body}"),
            },
        }
    }
}

/// Passes successful responses through and classifies the rest.
pub(crate) async fn check_response(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::from_status(service, status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_mapping_separates_auth_from_server_faults() {
        assert!(Error::from_status("store", StatusCode::UNAUTHORIZED, String::new()).is_auth());
        assert!(Error::from_status("store", StatusCode::FORBIDDEN, String::new()).is_auth());
        assert!(matches!(
            Error::from_status("store", StatusCode::BAD_GATEWAY, String::new()),
            Error::Network { .. }
        ));
        assert!(matches!(
            Error::from_status("store", StatusCode::BAD_REQUEST, "nope".into()),
            Error::Payload { .. }
        ));
    }
}
