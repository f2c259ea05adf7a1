use rfs_core::collaborators::{
    CollaboratorError, CollaboratorFailureKind, HttpMethod, HttpRequest, HttpResponse,
    HttpTransport,
};
use std::time::Duration;

/// Blocking HTTP transport to one cluster endpoint.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CollaboratorError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| CollaboratorError::new(CollaboratorFailureKind::Io, err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
        })
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, CollaboratorError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Head => self.client.head(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|err| {
            let kind = if err.is_connect() || err.is_timeout() {
                CollaboratorFailureKind::Unreachable
            } else {
                CollaboratorFailureKind::Io
            };
            CollaboratorError::new(kind, format!("{} {url}: {err}", request.method))
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let payload = response
            .bytes()
            .map_err(|err| CollaboratorError::new(CollaboratorFailureKind::Io, err.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            payload,
        })
    }
}
