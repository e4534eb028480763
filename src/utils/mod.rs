pub mod logging;
pub mod metrics;

/// Strips the query string and fragment from a URL-ish path before it is
/// buffered, so telemetry never captures tokens or PII embedded in queries
pub fn strip_query(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment)
        .to_string()
}

/// Rounds a pixel coordinate down to the nearest multiple of `granularity`
pub fn round_coordinate(value: u32, granularity: u32) -> u32 {
    if granularity <= 1 {
        return value;
    }
    (value / granularity) * granularity
}

/// Sanitizes a string for use in logs (removes bearer tokens and API keys)
pub fn sanitize_for_log(input: &str) -> String {
    let mut output = input.to_string();

    if let Some(token) = output
        .split("Bearer ")
        .nth(1)
        .and_then(|rest| rest.split(|c: char| c == '"' || c.is_whitespace()).next())
    {
        if !token.is_empty() {
            let token = token.to_string();
            output = output.replace(&token, "[REDACTED]");
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_query() {
        assert_eq!(strip_query("/reports?token=abc123"), "/reports");
        assert_eq!(strip_query("/dashboard"), "/dashboard");
        assert_eq!(strip_query("/a/b?x=1#frag"), "/a/b");
    }

    #[test]
    fn test_round_coordinate() {
        assert_eq!(round_coordinate(1237, 10), 1230);
        assert_eq!(round_coordinate(9, 10), 0);
        assert_eq!(round_coordinate(42, 1), 42);
        assert_eq!(round_coordinate(42, 0), 42);
    }

    #[test]
    fn test_sanitize_for_log() {
        let input = r#"Authorization: Bearer eyJhbGciOi "rest""#;
        let output = sanitize_for_log(input);
        assert!(!output.contains("eyJhbGciOi"));
        assert!(output.contains("[REDACTED]"));
    }
}
