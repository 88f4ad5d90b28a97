//! HTTP task attempts and HTTP config validation.

use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};

use super::executor::Attempt;
use super::task::HttpConfig;
use crate::error::{Error, Result};

const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Reject configs that can never succeed.
pub fn validate(config: &HttpConfig) -> Result<()> {
    let url = url::Url::parse(&config.url)
        .map_err(|e| Error::InvalidConfig(format!("invalid url '{}': {e}", config.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidConfig(format!(
            "unsupported url scheme '{}'",
            url.scheme()
        )));
    }

    let method = config.method.to_ascii_uppercase();
    if !METHODS.contains(&method.as_str()) {
        return Err(Error::InvalidConfig(format!(
            "unsupported HTTP method '{}'",
            config.method
        )));
    }

    if !(100..=599).contains(&config.expected_code) {
        return Err(Error::InvalidConfig(format!(
            "expected status code {} is outside 100..=599",
            config.expected_code
        )));
    }

    for (name, value) in &config.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("invalid header name '{name}': {e}")))?;
        HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidConfig(format!("invalid value for header '{name}': {e}")))?;
    }
    Ok(())
}

/// Issue the request once. Transport errors and unexpected status codes are
/// retriable failures; the response body is kept as output either way.
pub(crate) async fn attempt(client: &reqwest::Client, config: &HttpConfig) -> Attempt {
    let method = match Method::from_bytes(config.method.to_ascii_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(e) => return Attempt::Fatal(format!("invalid HTTP method '{}': {e}", config.method)),
    };

    let mut request = client.request(method, &config.url);
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if !config.body.is_empty() {
        if !config
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
        {
            request = request.header(CONTENT_TYPE, content_type_for(&config.body));
        }
        request = request.body(config.body.clone());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return Attempt::Failure {
                output: String::new(),
                error: format!("request failed: {e}"),
            };
        }
    };

    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            return Attempt::Failure {
                output: String::new(),
                error: format!("failed to read response body: {e}"),
            };
        }
    };

    if status == config.expected_code {
        Attempt::Success(body)
    } else {
        Attempt::Failure {
            output: body,
            error: format!(
                "unexpected status code {status}, expected {}",
                config.expected_code
            ),
        }
    }
}

fn content_type_for(body: &str) -> &'static str {
    match body.trim_start().chars().next() {
        Some('{' | '[') => "application/json",
        _ => "application/x-www-form-urlencoded",
    }
}
