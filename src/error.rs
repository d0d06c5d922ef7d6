//! Error types for stackyard

use thiserror::Error;

/// Result type for stackyard operations
pub type Result<T> = std::result::Result<T, StackError>;

/// A forbidden Compose property together with the hint shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenProperty {
    /// Dotted path of the offending key (`services.web.cpu_shares`)
    pub path: String,
    /// One-line remediation
    pub hint: String,
}

/// stackyard error types
#[derive(Error, Debug)]
pub enum StackError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Validation(String),

    #[error("{}", format_forbidden(.0))]
    ForbiddenProperties(Vec<ForbiddenProperty>),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Error response from daemon: {message}")]
    Remote { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{}", .0.join("\n"))]
    Partial(Vec<String>),

    #[error("{0}")]
    Interpolation(String),

    #[error("Template error: {0}")]
    Template(String),
}

impl StackError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            StackError::Usage(_) => 125,
            _ => 1,
        }
    }

    /// True for 404-equivalents coming from the engine, the registry or the store
    pub fn is_not_found(&self) -> bool {
        match self {
            StackError::NotFound(_) => true,
            StackError::Remote { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Build a remote error from a status code and a response body
    pub fn remote(status: u16, body: &[u8]) -> Self {
        #[derive(serde::Deserialize)]
        struct Message {
            message: String,
        }

        let message = match serde_json::from_slice::<Message>(body) {
            Ok(m) => m.message,
            Err(_) => String::from_utf8_lossy(body).trim().to_string(),
        };
        StackError::Remote { status, message }
    }
}

impl From<serde_yaml::Error> for StackError {
    fn from(e: serde_yaml::Error) -> Self {
        StackError::Yaml(e.to_string())
    }
}

impl From<reqwest::Error> for StackError {
    fn from(e: reqwest::Error) -> Self {
        StackError::Http(e.to_string())
    }
}

impl From<hyper::Error> for StackError {
    fn from(e: hyper::Error) -> Self {
        StackError::Http(e.to_string())
    }
}

impl From<tera::Error> for StackError {
    fn from(e: tera::Error) -> Self {
        use std::error::Error as _;
        let mut message = e.to_string();
        let mut source = e.source();
        while let Some(inner) = source {
            message = format!("{}: {}", message, inner);
            source = inner.source();
        }
        StackError::Template(message)
    }
}

fn format_forbidden(props: &[ForbiddenProperty]) -> String {
    let mut out = String::from("Compose file contains forbidden properties:");
    for prop in props {
        out.push_str(&format!("\n  {}: {}", prop.path, prop.hint));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(StackError::Usage("bad".to_string()).exit_code(), 125);
        assert_eq!(StackError::Validation("bad".to_string()).exit_code(), 1);
        assert_eq!(StackError::Partial(vec!["a".to_string()]).exit_code(), 1);
    }

    #[test]
    fn test_remote_message_from_json_body() {
        let err = StackError::remote(404, br#"{"message":"service foo not found"}"#);
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Error response from daemon: service foo not found"
        );
    }

    #[test]
    fn test_remote_message_from_plain_body() {
        let err = StackError::remote(500, b"boom\n");
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Error response from daemon: boom");
    }

    #[test]
    fn test_forbidden_lists_every_key() {
        let err = StackError::ForbiddenProperties(vec![
            ForbiddenProperty {
                path: "services.web.cpu_shares".to_string(),
                hint: "Set resource reservations using deploy.resources".to_string(),
            },
            ForbiddenProperty {
                path: "services.web.volumes_from".to_string(),
                hint: "To share a volume between services, define it as a top-level volume"
                    .to_string(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("services.web.cpu_shares"));
        assert!(text.contains("services.web.volumes_from"));
    }

    #[test]
    fn test_partial_joins_lines() {
        let err = StackError::Partial(vec!["one".to_string(), "two".to_string()]);
        assert_eq!(err.to_string(), "one\ntwo");
    }
}
