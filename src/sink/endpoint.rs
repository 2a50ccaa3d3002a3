//! Icecast mount URL parsing
//!
//! Accepts `icecast://`, `icecast+http(s)://`, plain `http(s)://` or a bare
//! `host:port/mount`. Credentials come out of the user-info part.

use percent_encoding::percent_decode_str;
use reqwest::Url;

use super::SinkError;

const DEFAULT_USERNAME: &str = "source";

#[derive(Debug, Clone)]
pub struct IcecastEndpoint {
    /// Mount URL with the credentials stripped
    pub url: Url,
    pub username: String,
    pub password: String,
}

impl IcecastEndpoint {
    pub fn parse(raw: &str) -> Result<Self, SinkError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SinkError::InvalidUrl("empty Icecast URL".to_string()));
        }

        let normalized = if let Some(rest) = trimmed.strip_prefix("icecast+") {
            rest.to_string()
        } else if let Some(rest) = trimmed.strip_prefix("icecast://") {
            format!("http://{}", rest)
        } else {
            trimmed.to_string()
        };
        let lower = normalized.to_ascii_lowercase();
        let normalized = if lower.starts_with("http://") || lower.starts_with("https://") {
            normalized
        } else {
            format!("http://{}", normalized)
        };

        let mut url = Url::parse(&normalized)
            .map_err(|e| SinkError::InvalidUrl(format!("{}: {}", redact(&normalized), e)))?;
        if url.host_str().is_none() {
            return Err(SinkError::InvalidUrl(format!("no host in {}", redact(&normalized))));
        }

        let username = match url.username() {
            "" => DEFAULT_USERNAME.to_string(),
            name => percent_decode_str(name).decode_utf8_lossy().into_owned(),
        };
        let password = url
            .password()
            .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned())
            .unwrap_or_default();

        // http(s) URLs with a host always accept these
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self {
            url,
            username,
            password,
        })
    }

    /// URL safe to log
    pub fn safe_url(&self) -> &str {
        self.url.as_str()
    }
}

/// Drop everything between the scheme and the last '@' of the authority
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
