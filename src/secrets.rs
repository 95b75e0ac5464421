use crate::config::Config;
use crate::error::Error;
use log::debug;
use std::path::PathBuf;
use tokio::sync::OnceCell;

/// Supplies the API access token. The first successful lookup is kept for the
/// lifetime of the process.
#[derive(Debug, Default)]
pub struct TokenSource {
    literal: Option<String>,
    file: Option<PathBuf>,
    cached: OnceCell<String>,
}

impl TokenSource {
    pub fn new(config: &Config) -> Self {
        TokenSource {
            literal: config.access_token.clone(),
            file: config.access_token_file.clone(),
            cached: OnceCell::new(),
        }
    }

    pub async fn token(&self) -> Result<&str, Error> {
        self.cached
            .get_or_try_init(|| self.resolve())
            .await
            .map(String::as_str)
    }

    async fn resolve(&self) -> Result<String, Error> {
        if let Some(token) = self.literal.as_deref().map(str::trim) {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }

        let Some(path) = &self.file else {
            return Err(Error::MissingSecret {
                message: "No access token configured (set ACCESS_TOKEN or ACCESS_TOKEN_FILE)"
                    .to_string(),
            });
        };

        debug!("reading access token from {}", path.display());
        let token = tokio::fs::read_to_string(path).await?.trim().to_string();
        if token.is_empty() {
            return Err(Error::MissingSecret {
                message: format!("Access token file {} is empty", path.display()),
            });
        }

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(literal: Option<&str>, file: Option<PathBuf>) -> TokenSource {
        TokenSource {
            literal: literal.map(str::to_string),
            file,
            cached: OnceCell::new(),
        }
    }

    #[tokio::test]
    async fn test_literal_token_wins() {
        let tokens = source(Some("  abc  "), Some(PathBuf::from("/does/not/exist")));
        assert_eq!(tokens.token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_token_file_is_read_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("token");
        std::fs::write(&path, "secret-token\n").unwrap();

        let tokens = source(None, Some(path.clone()));
        assert_eq!(tokens.token().await.unwrap(), "secret-token");

        std::fs::write(&path, "rotated").unwrap();
        assert_eq!(tokens.token().await.unwrap(), "secret-token");
    }

    #[tokio::test]
    async fn test_missing_token() {
        let tokens = source(Some(""), None);
        assert!(matches!(
            tokens.token().await.unwrap_err(),
            Error::MissingSecret { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_token_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("token");
        std::fs::write(&path, "   ").unwrap();

        let tokens = source(None, Some(path));
        assert!(matches!(
            tokens.token().await.unwrap_err(),
            Error::MissingSecret { .. }
        ));
    }
}
