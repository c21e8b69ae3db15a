//! Sanitization of client-supplied environment variables.
//!
//! Everything here is fatal with an `InvalidInput` error; the HTTP layer
//! renders those as 400 with the message untouched, so tests assert on the
//! exact wording.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, RunnerError};

pub const MAX_ENV_VARS_JSON_SIZE: usize = 5000;
pub const MAX_ENV_VARS_COUNT: usize = 30;
pub const MAX_ENV_KEY_LENGTH: usize = 50;
pub const MAX_ENV_VALUE_LENGTH: usize = 500;

static SAFE_ENV_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static UNSAFE_ENV_VALUE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"[;&|`$(){}]",          // shell metacharacters
        r"\.\.[\\/]",            // path traversal
        r"\\x[0-9a-fA-F]{2}",    // hex escapes
        r"%[0-9a-fA-F]{2}",      // URL encoding
        r"https?://",            // URLs
        r"ftp://",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Compared against the uppercased key.
const PROTECTED_ENV_VARS: &[&str] = &[
    // System paths and libraries
    "PATH",
    "LD_LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    "PYTHONPATH",
    "LD_PRELOAD",
    "LD_AUDIT",
    "MALLOC_CHECK_",
    // User and system information
    "HOME",
    "USER",
    "USERNAME",
    "LOGNAME",
    "SHELL",
    "TERM",
    "PWD",
    // Network and proxy settings
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "FTP_PROXY",
    "ALL_PROXY",
    "NO_PROXY",
    // Temporary and working directories
    "TMPDIR",
    "TMP",
    "TEMP",
    "TEMPDIR",
    // Python-specific dangerous variables
    "PYTHONSTARTUP",
    "PYTHONEXECUTABLE",
    "PYTHONHOME",
    // Process and debugging
    "PYTHONDEBUG",
    "PYTHONINSPECT",
    "PYTHONOPTIMIZE",
];

/// Parse and sanitize an `env_vars` JSON string. Non-string scalars are
/// stringified; containers end up rejected by the metacharacter rule.
pub fn parse_env_vars(
    env_vars: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let Some(env_vars) = env_vars.filter(|raw| !raw.is_empty()) else {
        return Ok(BTreeMap::new());
    };
    if env_vars.len() > MAX_ENV_VARS_JSON_SIZE {
        return Err(RunnerError::invalid_input(format!(
            "env_vars JSON string exceeds {MAX_ENV_VARS_JSON_SIZE} bytes"
        )));
    }
    let parsed: Value = serde_json::from_str(env_vars).map_err(|_| {
        RunnerError::invalid_input("Invalid JSON format for env_vars")
    })?;
    let Value::Object(object) = parsed else {
        return Err(RunnerError::invalid_input(
            "env_vars must be a JSON object",
        ));
    };
    if object.len() > MAX_ENV_VARS_COUNT {
        return Err(RunnerError::invalid_input(format!(
            "env_vars JSON object exceeds {MAX_ENV_VARS_COUNT} items"
        )));
    }
    let mut sanitized = BTreeMap::new();
    for (key, value) in object {
        let value = stringify(&value);
        if PROTECTED_ENV_VARS.contains(&key.to_uppercase().as_str()) {
            return Err(RunnerError::invalid_input(format!(
                "Cannot override protected system variable: {key}"
            )));
        }
        if key.len() > MAX_ENV_KEY_LENGTH {
            return Err(RunnerError::invalid_input(format!(
                "env_vars key '{key}' exceeds {MAX_ENV_KEY_LENGTH} characters"
            )));
        }
        if value.len() > MAX_ENV_VALUE_LENGTH {
            return Err(RunnerError::invalid_input(format!(
                "env_vars value for key '{key}' exceeds \
                 {MAX_ENV_VALUE_LENGTH} characters"
            )));
        }
        if !SAFE_ENV_KEY.is_match(&key) {
            return Err(RunnerError::invalid_input(format!(
                "env_vars key '{key}' contains unsafe characters"
            )));
        }
        if UNSAFE_ENV_VALUE.iter().any(|p| p.is_match(&value)) {
            return Err(RunnerError::invalid_input(format!(
                "env_vars value for key '{key}' contains unsafe characters"
            )));
        }
        sanitized.insert(key, value);
    }
    Ok(sanitized)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse(raw: &str) -> Result<BTreeMap<String, String>> {
        parse_env_vars(Some(raw))
    }

    fn single(key: &str, value: impl Into<Value>) -> String {
        let mut object = serde_json::Map::new();
        object.insert(key.to_string(), value.into());
        Value::Object(object).to_string()
    }

    #[test]
    fn empty_input_yields_empty_map() {
        assert!(parse_env_vars(None).unwrap().is_empty());
        assert!(parse_env_vars(Some("")).unwrap().is_empty());
    }

    #[test]
    fn accepts_simple_vars() {
        let vars = parse(r#"{"FOO": "bar", "MY_VAR_2": "value"}"#).unwrap();
        assert_eq!(vars.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn stringifies_scalars() {
        let vars =
            parse(r#"{"NUM": 42, "FLAG": true, "NOTHING": null}"#).unwrap();
        assert_eq!(vars.get("NUM").map(String::as_str), Some("42"));
        assert_eq!(vars.get("FLAG").map(String::as_str), Some("true"));
        assert_eq!(vars.get("NOTHING").map(String::as_str), Some("null"));
    }

    #[test]
    fn containers_fail_the_metacharacter_rule() {
        let err = parse(r#"{"OBJ": {"a": 1}}"#).unwrap_err();
        assert!(err.to_string().contains("unsafe characters"));
    }

    #[test]
    fn rejects_protected_vars_case_insensitively() {
        for key in ["PATH", "path", "Home", "https_proxy", "PYTHONHOME"] {
            let raw = format!(r#"{{"{key}": "/x"}}"#);
            let err = parse(&raw).unwrap_err();
            assert!(
                err.to_string()
                    .contains("Cannot override protected system variable"),
                "{key}: {err}"
            );
        }
    }

    #[test]
    fn rejects_shell_metacharacters() {
        let err = parse(r#"{"FOO": "a; rm -rf /"}"#).unwrap_err();
        assert!(err.to_string().contains("unsafe characters"));
        for value in [
            "a|b", "a&b", "`cmd`", "$(cmd)", "{x}", "..\\up", "../up",
            "\\x41", "%41", "http://evil", "https://evil", "ftp://evil",
        ] {
            let raw = single("FOO", value);
            assert!(parse(&raw).is_err(), "should reject {value:?}");
        }
    }

    #[test]
    fn rejects_bad_keys() {
        for key in ["1BAD", "BAD-KEY", "BAD KEY", "BAD.KEY", ""] {
            let raw = single(key, "v");
            let err = parse(&raw).unwrap_err();
            assert!(
                err.to_string().contains("unsafe characters"),
                "{key}: {err}"
            );
        }
    }

    #[test]
    fn enforces_length_limits() {
        let long_key = "K".repeat(MAX_ENV_KEY_LENGTH + 1);
        let raw = single(&long_key, "v");
        assert!(parse(&raw).unwrap_err().to_string().contains("exceeds"));

        let long_value = "v".repeat(MAX_ENV_VALUE_LENGTH + 1);
        let raw = single("FOO", long_value);
        assert!(parse(&raw).unwrap_err().to_string().contains("exceeds"));
    }

    #[test]
    fn enforces_count_limit() {
        let mut object = serde_json::Map::new();
        for i in 0..=MAX_ENV_VARS_COUNT {
            object.insert(format!("VAR_{i}"), "x".into());
        }
        let raw = serde_json::Value::Object(object).to_string();
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn enforces_size_limit() {
        let raw = format!(
            r#"{{"FOO": "{}"}}"#,
            "x".repeat(MAX_ENV_VARS_JSON_SIZE)
        );
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("bytes"));
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(parse("42").is_err());
        assert!(parse("[1, 2]").is_err());
        assert!(parse("not json").is_err());
    }

    proptest! {
        #[test]
        fn safe_keys_with_plain_values_pass(
            key in "[A-Za-z_][A-Za-z0-9_]{0,48}",
            value in "[A-Za-z0-9 _.,-]{0,100}",
        ) {
            prop_assume!(
                !PROTECTED_ENV_VARS.contains(&key.to_uppercase().as_str())
            );
            let raw = single(&key, value.clone());
            let vars = parse(&raw).unwrap();
            prop_assert_eq!(vars.get(&key), Some(&value));
        }

        #[test]
        fn values_with_unsafe_patterns_never_pass(
            prefix in "[a-z]{0,5}",
            bad in prop::sample::select(vec![
                ";", "|", "&", "`", "$", "(", ")", "{", "}",
                "../", "..\\", "%4F", "\\x4f", "http://", "https://",
                "ftp://",
            ]),
            suffix in "[a-z]{0,5}",
        ) {
            let value = format!("{prefix}{bad}{suffix}");
            let raw = single("FOO", value);
            prop_assert!(parse(&raw).is_err());
        }
    }
}
