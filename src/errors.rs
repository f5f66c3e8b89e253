use thiserror::Error;

pub type SigilResult<T, E = SigilError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SigilError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("config error: {0}")]
  TomlDe(#[from] toml::de::Error),

  #[error("walk error: {0}")]
  Walk(#[from] ignore::Error),

  #[error("malformed unit `{unit}`: {reason}")]
  MalformedUnit { unit: String, reason: String },

  #[error("finding references rule `{0}` which is not in the pattern library")]
  UnresolvedRuleReference(String),

  #[error("taint propagation in `{unit}` stopped after {cap} visits of one node")]
  TaintCapExceeded { unit: String, cap: usize },

  #[error("pattern library failed to load: {0}")]
  PatternLibrary(String),

  #[error("thread-pool error: {0}")]
  ThreadPool(#[from] rayon::ThreadPoolBuildError),

  #[error("other: {0}")]
  Other(String),
}

impl From<&str> for SigilError {
  fn from(s: &str) -> Self {
    SigilError::Other(s.to_owned())
  }
}

impl From<String> for SigilError {
  fn from(s: String) -> Self {
    SigilError::Other(s)
  }
}
