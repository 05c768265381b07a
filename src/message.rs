use http::{HeaderMap, Method, StatusCode};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("invalid method")]
    InvalidMethod(#[from] http::method::InvalidMethod),

    #[error("invalid status")]
    InvalidStatus(#[from] http::status::InvalidStatusCode),

    #[error("invalid header name")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("invalid header value")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("missing pseudo headers: {0}")]
    MissingPseudoHeaders(&'static str),

    #[error("pseudo header after regular header")]
    MisplacedPseudoHeader,
}

/// The header section of a request or response.
///
/// Requests carry method/scheme/authority/path, responses a status code;
/// both carry regular fields.
#[derive(Debug, Clone, Default)]
pub struct HttpMessage {
    pub method: Option<Method>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
}

impl HttpMessage {
    pub fn request(method: Method, authority: &str, path: &str) -> Self {
        Self {
            method: Some(method),
            scheme: Some("https".to_string()),
            authority: Some(authority.to_string()),
            path: Some(path.to_string()),
            ..Default::default()
        }
    }

    pub fn response(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// A 1xx interim response, delivered without closing the header phase.
    pub fn is_interim(&self) -> bool {
        self.status.map(|s| s.is_informational()).unwrap_or(false)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), MessageError> {
        let name = http::header::HeaderName::try_from(name)?;
        let value = http::header::HeaderValue::try_from(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Flatten into field lines, pseudo-headers first.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();

        if let Some(method) = &self.method {
            fields.push((":method".to_string(), method.to_string()));
        }
        if let Some(scheme) = &self.scheme {
            fields.push((":scheme".to_string(), scheme.clone()));
        }
        if let Some(authority) = &self.authority {
            fields.push((":authority".to_string(), authority.clone()));
        }
        if let Some(path) = &self.path {
            fields.push((":path".to_string(), path.clone()));
        }
        if let Some(status) = &self.status {
            fields.push((":status".to_string(), status.as_str().to_string()));
        }

        for (name, value) in &self.headers {
            let value = String::from_utf8_lossy(value.as_bytes()).to_string();
            fields.push((name.as_str().to_string(), value));
        }

        fields
    }

    /// Rebuild from decoded field lines.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, MessageError> {
        let mut msg = HttpMessage::default();
        let mut seen_regular = false;

        for (name, value) in fields {
            match name.as_str() {
                ":method" => msg.method = Some(value.parse()?),
                ":scheme" => msg.scheme = Some(value.clone()),
                ":authority" => msg.authority = Some(value.clone()),
                ":path" => msg.path = Some(value.clone()),
                ":status" => msg.status = Some(value.parse()?),
                _ => {
                    if name.starts_with(':') {
                        return Err(MessageError::MissingPseudoHeaders("unknown pseudo header"));
                    }
                    seen_regular = true;
                    msg.set_header(name, value)?;
                    continue;
                }
            }

            if seen_regular {
                return Err(MessageError::MisplacedPseudoHeader);
            }
        }

        if msg.status.is_none() && msg.method.is_none() {
            return Err(MessageError::MissingPseudoHeaders(":status or :method"));
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let mut msg = HttpMessage::request(Method::GET, "example.com", "/index.html");
        msg.set_header("user-agent", "h3-mux").unwrap();

        let decoded = HttpMessage::from_fields(&msg.to_fields()).unwrap();
        assert_eq!(decoded.method, Some(Method::GET));
        assert_eq!(decoded.authority.as_deref(), Some("example.com"));
        assert_eq!(decoded.path.as_deref(), Some("/index.html"));
        assert_eq!(decoded.header("user-agent"), Some("h3-mux"));
        assert!(!decoded.is_interim());
    }

    #[test]
    fn interim_response() {
        let msg = HttpMessage::response(StatusCode::CONTINUE);
        assert!(msg.is_interim());

        let msg = HttpMessage::response(StatusCode::OK);
        assert!(!msg.is_interim());
    }

    #[test]
    fn pseudo_after_regular_rejected() {
        let fields = vec![
            ("x-first".to_string(), "1".to_string()),
            (":status".to_string(), "200".to_string()),
        ];

        assert!(HttpMessage::from_fields(&fields).is_err());
    }

    #[test]
    fn empty_section_rejected() {
        assert!(HttpMessage::from_fields(&[]).is_err());
    }
}
