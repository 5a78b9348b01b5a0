use url::Url;

/// Components of a tracked URL as stored on page and request rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub host: String,
    pub path: String,
    /// Query string without the leading `?`, if any
    pub query: Option<String>,
}

/// Split an absolute URL into host, path and query.
///
/// A URL without a scheme is parsed as `http://`, trackers sometimes send bare hosts.
pub fn url_parts(raw: &str) -> Result<UrlParts, url::ParseError> {
    let parsed = match Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("http://{raw}"))?,
        Err(err) => return Err(err),
    };

    let host = match (parsed.host_str(), parsed.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };

    Ok(UrlParts {
        host,
        path: parsed.path().to_string(),
        query: parsed.query().map(str::to_string),
    })
}

/// Drop everything from the first `?` or `#`.
pub fn discard_query(raw: &str) -> &str {
    match raw.find(['?', '#']) {
        Some(index) => &raw[..index],
        None => raw,
    }
}

const METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// Upper-cased HTTP method, or empty when it is not a known method.
pub fn ensure_method(method: &str) -> String {
    let upper = method.trim().to_ascii_uppercase();
    if METHODS.contains(&upper.as_str()) {
        upper
    } else {
        String::new()
    }
}
