use std::fmt;

#[derive(Debug)]
pub struct Error {
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self { msg: msg.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single upload attempt. Every variant is retried by the engine
/// until the attempt ceiling is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    InvalidUrl(String),
    /// Server answered outside the 2xx range.
    Status(u16),
    /// Server answered 2xx but the body was not an upload result.
    Decoding(String),
    Transport(String),
    /// Generic failure used when no artifact was handed over at all.
    UploadFailed,
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::InvalidUrl(url) => write!(f, "invalid upload url '{url}'"),
            UploadError::Status(code) => write!(f, "server returned status code {code}"),
            UploadError::Decoding(e) => write!(f, "failed to decode response: {e}"),
            UploadError::Transport(e) => write!(f, "transport error: {e}"),
            UploadError::UploadFailed => write!(f, "file upload failed"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return UploadError::Decoding(err.to_string());
        }
        if let Some(status) = err.status() {
            return UploadError::Status(status.as_u16());
        }
        UploadError::Transport(err.to_string())
    }
}

/// Why an artifact was refused at enqueue time. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Missing,
    NotGeotagged,
    TooLarge { size: usize, limit: usize },
}

pub const GEOTAG_REASON: &str = "Image must be geotagged.";
pub const SIZE_REASON: &str = "Image must be under 5MB.";

pub fn exhausted_reason(attempts: u32) -> String {
    format!("Upload failed after {attempts} attempts. Will retry later.")
}

impl Rejection {
    /// Human-readable reason shown to the presentation layer.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Missing => "No image selected.",
            Rejection::NotGeotagged => GEOTAG_REASON,
            Rejection::TooLarge { .. } => SIZE_REASON,
        }
    }

    pub fn is_permanent(&self) -> bool {
        !matches!(self, Rejection::Missing)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooLarge { size, limit } => {
                write!(f, "{} ({size} bytes, limit {limit})", self.reason())
            }
            _ => write!(f, "{}", self.reason()),
        }
    }
}

impl std::error::Error for Rejection {}
