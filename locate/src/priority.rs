//! Request priority classes.
//!
//!  API key | Access token | Priority
//!  --------|--------------|--------------------------------
//!  yes     | valid        | API key, high availability pool
//!  yes     | none/invalid | API key, best effort pool
//!  no      | any          | global best effort pool
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    ApiKeyHighAvailability,
    ApiKeyBestEffort,
    GlobalBestEffort,
}

impl PriorityClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::ApiKeyHighAvailability => "api_key_high_availability",
            PriorityClass::ApiKeyBestEffort => "api_key_best_effort",
            PriorityClass::GlobalBestEffort => "global_best_effort",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assigns a request to its priority class. An invalid or expired token
/// degrades the request to best effort, it never rejects it. Tokens only
/// count when paired with an API key.
pub fn classify(has_api_key: bool, token_present: bool, token_valid: bool) -> PriorityClass {
    match (has_api_key, token_present && token_valid) {
        (true, true) => PriorityClass::ApiKeyHighAvailability,
        (true, false) => PriorityClass::ApiKeyBestEffort,
        (false, _) => PriorityClass::GlobalBestEffort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_truth_table() {
        use PriorityClass::*;

        let cases = [
            // (has_api_key, token_present, token_valid, expected)
            (true, true, true, ApiKeyHighAvailability),
            (true, true, false, ApiKeyBestEffort),
            (true, false, false, ApiKeyBestEffort),
            (true, false, true, ApiKeyBestEffort),
            (false, true, true, GlobalBestEffort),
            (false, true, false, GlobalBestEffort),
            (false, false, false, GlobalBestEffort),
            (false, false, true, GlobalBestEffort),
        ];

        for (has_api_key, token_present, token_valid, expected) in cases {
            assert_eq!(
                classify(has_api_key, token_present, token_valid),
                expected,
                "classify({has_api_key}, {token_present}, {token_valid})"
            );
        }
    }
}
