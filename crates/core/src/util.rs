use url::Url;

/// Prefix `https://` onto an endpoint that was configured without a scheme.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

/// Join a path onto an API base URL, tolerating a trailing slash on the base.
pub fn api_url(base: &str, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)?.join(path.trim_start_matches('/'))
}

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        let cases: &[(&str, &str)] = &[
            ("s3.amazonaws.com", "https://s3.amazonaws.com"),
            ("http://minio:9000", "http://minio:9000"),
            ("https://s3.example.com", "https://s3.example.com"),
            (" storage.local ", "https://storage.local"),
        ];
        for &(input, expected) in cases {
            assert_eq!(normalize_endpoint(input), expected);
        }
    }

    #[test]
    fn test_api_url() {
        assert_eq!(
            api_url("https://api.github.com", "/repos/foo/bar/dispatches").unwrap().as_str(),
            "https://api.github.com/repos/foo/bar/dispatches"
        );
        assert_eq!(
            api_url("https://ghe.example.com/api/v3/", "repos/foo/bar/dispatches").unwrap().as_str(),
            "https://ghe.example.com/api/v3/repos/foo/bar/dispatches"
        );
    }
}
