//! Credential handling.
//!
//! Passwords in the configuration file may reference secrets stored outside
//! of it:
//!
//! - `env::VAR_NAME`: reads `$VAR_NAME` from the environment
//! - anything else: used as-is (plain text)
//!
//! Every log line that mentions a credential goes through [`mask_secret`].

/// Resolves a value that may contain a secret reference prefix.
pub fn resolve(value: &str) -> Result<String, String> {
    if let Some(var) = value.strip_prefix("env::") {
        std::env::var(var).map_err(|_| format!("environment variable `{}` is not set", var))
    } else {
        Ok(value.to_string())
    }
}

/// Masks a credential for logging.
///
/// The first two and last two characters stay visible; everything in
/// between is replaced by `*`. Values of four characters or fewer are fully
/// masked.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passthrough() {
        assert_eq!(resolve("hunter22").unwrap(), "hunter22");
        assert_eq!(resolve("").unwrap(), "");
    }

    #[test]
    fn env_prefix_resolves() {
        unsafe {
            std::env::set_var("_CALSYNC_TEST_SECRET", "s3cret-value");
        }
        assert_eq!(resolve("env::_CALSYNC_TEST_SECRET").unwrap(), "s3cret-value");
        unsafe {
            std::env::remove_var("_CALSYNC_TEST_SECRET");
        }
    }

    #[test]
    fn env_prefix_missing_var_errors() {
        let result = resolve("env::_CALSYNC_NONEXISTENT_VAR_98765");
        assert!(result.unwrap_err().contains("not set"));
    }

    #[test]
    fn masks_middle_characters() {
        assert_eq!(mask_secret("password123"), "pa*******23");
        assert_eq!(mask_secret("abcde"), "ab*de");
    }

    #[test]
    fn short_secrets_fully_masked() {
        assert_eq!(mask_secret("abcd"), "****");
        assert_eq!(mask_secret("ab"), "**");
        assert_eq!(mask_secret(""), "");
    }
}
