//! Validation of the host and domain names the controller generates or accepts.
//!
//! The formats are adapted from Kubernetes, see apimachinery/pkg/util/validation/validation.go.

use std::{fmt::Display, ops::Deref, str::FromStr, sync::LazyLock};

use const_format::concatcp;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Minimal length required by RFC 1123 is 63. Up to 255 allowed, unsupported by k8s.
const RFC_1123_LABEL_MAX_LENGTH: usize = 63;
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const RFC_1123_LABEL_ERROR_MSG: &str = "a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character";

/// This is a subdomain's max length in DNS (RFC 1123)
const RFC_1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const RFC_1123_SUBDOMAIN_FMT: &str =
    concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");
const RFC_1123_SUBDOMAIN_ERROR_MSG: &str = "a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character";

static RFC_1123_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_LABEL_FMT}$")).expect("failed to compile RFC 1123 label regex")
});

static RFC_1123_SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_SUBDOMAIN_FMT}$"))
        .expect("failed to compile RFC 1123 subdomain regex")
});

type Result<T = (), E = Errors> = std::result::Result<T, E>;

/// A collection of errors discovered during validation.
#[derive(Debug)]
pub struct Errors(Vec<Error>);

impl Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            let prefix = match i {
                0 => "",
                _ => ", ",
            };
            write!(f, "{prefix}{error}")?;
        }
        Ok(())
    }
}
impl std::error::Error for Errors {}

/// A single validation error.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{msg} (regex used for validation is {regex:?})"))]
    Regex {
        msg: &'static str,
        regex: &'static str,
    },

    #[snafu(display("input is {length} bytes long but must be no more than {max_length}"))]
    TooLong { length: usize, max_length: usize },
}

/// Returns [`Ok`] if `value`'s length fits within `max_length`.
fn validate_str_length(value: &str, max_length: usize) -> Result<(), Error> {
    if value.len() > max_length {
        TooLongSnafu {
            length: value.len(),
            max_length,
        }
        .fail()
    } else {
        Ok(())
    }
}

/// Returns [`Ok`] if `value` matches `regex`.
fn validate_str_regex(
    value: &str,
    regex: &'static Regex,
    error_msg: &'static str,
) -> Result<(), Error> {
    if regex.is_match(value) {
        Ok(())
    } else {
        RegexSnafu {
            msg: error_msg,
            regex: regex
                .as_str()
                .trim_start_matches('^')
                .trim_end_matches('$'),
        }
        .fail()
    }
}

/// Returns [`Ok`] if *all* validations are [`Ok`], otherwise returns all errors.
fn validate_all(validations: impl IntoIterator<Item = Result<(), Error>>) -> Result {
    let errors = validations
        .into_iter()
        .filter_map(|res| res.err())
        .collect::<Vec<_>>();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Errors(errors))
    }
}

/// Tests for a string that conforms to the definition of a lowercase label in DNS (RFC 1123).
pub fn is_rfc_1123_label(value: &str) -> Result {
    validate_all([
        validate_str_length(value, RFC_1123_LABEL_MAX_LENGTH),
        validate_str_regex(value, &RFC_1123_LABEL_REGEX, RFC_1123_LABEL_ERROR_MSG),
    ])
}

/// Tests for a string that conforms to the definition of a lowercase subdomain in DNS (RFC 1123).
///
/// Every host the controller publishes a record for must pass this check.
pub fn is_rfc_1123_subdomain(value: &str) -> Result {
    validate_all([
        validate_str_length(value, RFC_1123_SUBDOMAIN_MAX_LENGTH),
        validate_str_regex(
            value,
            &RFC_1123_SUBDOMAIN_REGEX,
            RFC_1123_SUBDOMAIN_ERROR_MSG,
        ),
    ])
}

/// A validated domain name, e.g. the managed domain generated hosts are placed under.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    /// Wraps a domain known to be valid, such as a built-in default.
    pub(crate) fn from_static(value: &'static str) -> Self {
        Self(value.to_owned())
    }
}

impl FromStr for DomainName {
    type Err = Errors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        is_rfc_1123_subdomain(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl TryFrom<String> for DomainName {
    type Error = Errors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DomainName> for String {
    fn from(value: DomainName) -> Self {
        value.0
    }
}

impl Display for DomainName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for DomainName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("")]
    #[case("-")]
    #[case("a-")]
    #[case("-a")]
    #[case("a_b")]
    #[case(".")]
    #[case("a.")]
    #[case(".a")]
    #[case("a..b")]
    #[case("a b")]
    #[case("A.example.com")]
    #[case("*.example.com")]
    #[case(&"a".repeat(254))]
    fn is_rfc_1123_subdomain_fail(#[case] value: &str) {
        assert!(is_rfc_1123_subdomain(value).is_err());
    }

    #[rstest]
    #[case("a")]
    #[case("a1")]
    #[case("a--1--2--b")]
    #[case("0.a")]
    #[case("hcpapps.net")]
    #[case("c9n5kq3l6prs2u2k1ea0.hcpapps.net")]
    #[case("sub.test.pb-custom.hcpapps.net")]
    #[case(&"a".repeat(253))]
    fn is_rfc_1123_subdomain_pass(#[case] value: &str) {
        assert!(is_rfc_1123_subdomain(value).is_ok());
    }

    #[rstest]
    #[case("c9n5kq3l6prs2u2k1ea0", true)]
    #[case("abc-123", true)]
    #[case("has.dot", false)]
    #[case(&"a".repeat(64), false)]
    fn rfc_1123_label(#[case] value: &str, #[case] valid: bool) {
        assert_eq!(is_rfc_1123_label(value).is_ok(), valid);
    }

    #[test]
    fn domain_name_round_trips_through_serde() {
        let domain: DomainName = serde_json::from_str("\"hcpapps.net\"").expect("valid domain");
        assert_eq!(&*domain, "hcpapps.net");
        assert_eq!(
            serde_json::to_string(&domain).expect("serializable"),
            "\"hcpapps.net\""
        );
        assert!(serde_json::from_str::<DomainName>("\"not a domain\"").is_err());
    }

    #[test]
    fn errors_are_joined() {
        let err = is_rfc_1123_label(&"_".repeat(64)).expect_err("invalid label");
        let msg = err.to_string();
        assert!(msg.contains("must be no more than 63"), "{msg}");
        assert!(msg.contains(", "), "{msg}");
    }
}
