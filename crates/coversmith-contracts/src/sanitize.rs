const REDACTED: &str = "<redacted>";

/// Credential prefixes redacted from surfaced text even when the exact
/// secret value is not known to the caller.
const TOKEN_PREFIXES: &[&str] = &["sk-", "AIza", "ghp_", "xoxb-", "ya29."];

/// Query parameters whose values are always credentials.
const SECRET_PARAMS: &[&str] = &["key=", "api_key=", "apikey=", "token="];

/// Strips anything resembling a credential from text destined for an
/// outcome record: exact known secret values, key-shaped tokens, and
/// secret-bearing query parameters.
pub fn scrub_secrets(text: &str, secrets: &[String]) -> String {
    let mut scrubbed = text.to_string();
    for secret in secrets {
        let value = secret.trim();
        // Very short values would cause false-positive replacements.
        if value.len() >= 8 {
            scrubbed = scrubbed.replace(value, REDACTED);
        }
    }
    scrubbed = redact_prefixed_tokens(&scrubbed);
    redact_secret_params(&scrubbed)
}

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')
}

fn redact_prefixed_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'outer: while !rest.is_empty() {
        for prefix in TOKEN_PREFIXES {
            if rest.starts_with(prefix) {
                let tail = &rest[prefix.len()..];
                let token_len = tail.chars().take_while(|ch| is_token_char(*ch)).count();
                if token_len >= 8 {
                    out.push_str(REDACTED);
                    let consumed: usize = tail
                        .chars()
                        .take(token_len)
                        .map(char::len_utf8)
                        .sum::<usize>()
                        + prefix.len();
                    rest = &rest[consumed..];
                    continue 'outer;
                }
            }
        }
        let ch = rest.chars().next().unwrap_or('\0');
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

fn redact_secret_params(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'outer: while !rest.is_empty() {
        for param in SECRET_PARAMS {
            // get() avoids slicing inside a multibyte character; upstream
            // error bodies are arbitrary UTF-8.
            let matches_param = rest
                .get(..param.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(param));
            if matches_param {
                let tail = &rest[param.len()..];
                let value_len = tail.chars().take_while(|ch| is_token_char(*ch)).count();
                if value_len > 0 {
                    out.push_str(param);
                    out.push_str(REDACTED);
                    let consumed: usize = tail
                        .chars()
                        .take(value_len)
                        .map(char::len_utf8)
                        .sum::<usize>()
                        + param.len();
                    rest = &rest[consumed..];
                    continue 'outer;
                }
            }
        }
        let ch = rest.chars().next().unwrap_or('\0');
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_secret_values_are_removed() {
        let secrets = vec!["super-secret-credential-123".to_string()];
        let scrubbed = scrub_secrets(
            "request failed: Authorization super-secret-credential-123 rejected",
            &secrets,
        );
        assert!(!scrubbed.contains("super-secret-credential-123"));
        assert!(scrubbed.contains("<redacted>"));
    }

    #[test]
    fn short_secrets_are_not_replaced_blindly() {
        let secrets = vec!["abc".to_string()];
        let scrubbed = scrub_secrets("abcdef is not a credential", &secrets);
        assert_eq!(scrubbed, "abcdef is not a credential");
    }

    #[test]
    fn key_shaped_tokens_are_redacted_without_knowing_them() {
        let scrubbed = scrub_secrets("401 from upstream using sk-proj-abcdef1234567890", &[]);
        assert!(!scrubbed.contains("sk-proj-abcdef1234567890"));
        assert!(scrubbed.contains("<redacted>"));
    }

    #[test]
    fn query_param_credentials_are_redacted() {
        let scrubbed = scrub_secrets(
            "POST https://api.example.com/v1/predict?key=AIzaFakeKey1234567890 failed",
            &[],
        );
        assert!(scrubbed.contains("key=<redacted>"));
        assert!(!scrubbed.contains("AIzaFakeKey1234567890"));
    }

    #[test]
    fn plain_text_passes_through() {
        let text = "provider returned no image URLs";
        assert_eq!(scrub_secrets(text, &[]), text);
    }

    #[test]
    fn multibyte_text_passes_through() {
        // Upstream error bodies are arbitrary UTF-8; the scanners must not
        // land mid-character.
        let text = "xx€ upstream said nein";
        assert_eq!(scrub_secrets(text, &[]), text);

        let truncated = "response body exceeded the limit…";
        assert_eq!(scrub_secrets(truncated, &[]), truncated);
    }

    #[test]
    fn credentials_next_to_multibyte_text_are_still_redacted() {
        let scrubbed = scrub_secrets(
            "Fehler: ungültiger Schlüssel key=AIzaFakeKey1234567890 übergeben",
            &[],
        );
        assert!(scrubbed.contains("key=<redacted>"));
        assert!(!scrubbed.contains("AIzaFakeKey1234567890"));
        assert!(scrubbed.contains("übergeben"));
    }
}
