//! Deterministic physical resource identifiers.
//!
//! Resource handlers that must invent a physical name for a resource use
//! [`generate_resource_identifier`] so that retries of the same request
//! produce the same name.

use std::sync::LazyLock;

use regex::Regex;
use sha1::{Digest, Sha1};

use crate::error::{ExtensionError, ExtensionResult};

/// Shortest identifier that still fits the hash and its separator.
pub const MIN_PHYSICAL_RESOURCE_ID_LENGTH: usize = 15;

/// Identifiers longer than this separate the stack and resource fragments.
pub const MIN_PREFERRED_LENGTH: usize = 17;

/// Number of hex characters taken from the request token hash.
pub const HASH_LENGTH: usize = 12;

static STACK_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9-:]*stack/[-a-z0-9A-Z]*/[-a-z0-9A-Z]*").expect("stack ARN regex is valid")
});

/// Generates a physical resource identifier of at most `max_length`
/// characters.
///
/// The identifier is `<stack>-<logical id>-<hash>`, where the hash is the
/// first 12 hex characters of the SHA-1 of `client_request_token`. When
/// `max_length` is 17 or less the separator between the stack and logical
/// id fragments is omitted. The fragments are truncated so that neither is
/// starved while the other still has room.
///
/// # Arguments
///
/// * `stack_id_or_name` - Stack name or full stack ARN
/// * `logical_resource_id` - Logical ID of the resource in the template
/// * `client_request_token` - Token that is stable across retries of a request
/// * `max_length` - Maximum identifier length, at least 15
///
/// # Errors
///
/// Returns a validation error if `max_length` is below 15.
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::identifier::generate_resource_identifier;
///
/// let id = generate_resource_identifier("abc", "abc", "123456", 36).unwrap();
/// assert_eq!(id, "abc-abc-7c4a8d09ca37");
/// ```
pub fn generate_resource_identifier(
    stack_id_or_name: &str,
    logical_resource_id: &str,
    client_request_token: &str,
    max_length: usize,
) -> ExtensionResult<String> {
    if max_length < MIN_PHYSICAL_RESOURCE_ID_LENGTH {
        return Err(ExtensionError::validation(format!(
            "Cannot generate resource IDs shorter than {} characters.",
            MIN_PHYSICAL_RESOURCE_ID_LENGTH
        )));
    }

    let stack_name = if STACK_ARN.is_match(stack_id_or_name) {
        stack_id_or_name.split('/').nth(1).unwrap_or(stack_id_or_name)
    } else {
        stack_id_or_name
    };
    let clean_stack_name = stack_name.replace("--", "-");

    let separate = max_length > MIN_PREFERRED_LENGTH;
    let free_chars = max_length - (HASH_LENGTH + 1) - usize::from(separate);

    let stack_chars: Vec<char> = clean_stack_name.chars().collect();
    let resource_chars: Vec<char> = logical_resource_id.chars().collect();
    let shares = fair_split(free_chars, &[stack_chars.len(), resource_chars.len()]);

    let mut identifier: String = stack_chars[..shares[0]].iter().collect();
    if separate {
        identifier.push('-');
    }
    identifier.extend(&resource_chars[..shares[1]]);
    identifier.push('-');
    identifier.push_str(&token_hash(client_request_token)[..HASH_LENGTH]);
    Ok(identifier)
}

fn token_hash(client_request_token: &str) -> String {
    hex::encode(Sha1::digest(client_request_token.as_bytes()))
}

/// Splits `total` across buckets wanting `wants[i]` each.
///
/// Every round hands `remaining / unsatisfied` (at least one) to each
/// bucket that is not yet full, in order, until the budget runs out or
/// every bucket is full. No bucket is ever given more than it wants.
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::identifier::fair_split;
///
/// assert_eq!(fair_split(10, &[20, 3]), vec![7, 3]);
/// assert_eq!(fair_split(0, &[10, 10]), vec![0, 0]);
/// ```
pub fn fair_split(total: usize, wants: &[usize]) -> Vec<usize> {
    let mut shares = vec![0; wants.len()];
    let mut remaining = total;

    while remaining > 0 {
        let wanting: Vec<usize> = (0..wants.len())
            .filter(|&i| shares[i] < wants[i])
            .collect();
        if wanting.is_empty() {
            break;
        }

        let share = (remaining / wanting.len()).max(1);
        for i in wanting {
            if remaining == 0 {
                break;
            }
            let grant = share.min(wants[i] - shares[i]).min(remaining);
            shares[i] += grant;
            remaining -= grant;
        }
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LONG_LOGICAL_ID: &str = "my-long-long-long-long-long-logical-id";

    #[test]
    fn test_generate_with_stack_name() {
        let id = generate_resource_identifier("my-custom-stack-name", LONG_LOGICAL_ID, "123456", 36).unwrap();
        assert_eq!(id, "my-custom-s-my-long-lon-7c4a8d09ca37");
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_generate_with_stack_arn() {
        let stack_id = "arn:aws:cloudformation:us-east-1:123456789012:stack/my-stack-name/084c0bd1-082b-11eb-afdc-0a2fadfa68a5";
        let id = generate_resource_identifier(stack_id, LONG_LOGICAL_ID, "123456", 36).unwrap();
        assert_eq!(id, "my-stack-na-my-long-lon-7c4a8d09ca37");
    }

    #[test]
    fn test_generate_short_inputs_fit() {
        let id = generate_resource_identifier("abc", "abc", "123456", 36).unwrap();
        assert_eq!(id, "abc-abc-7c4a8d09ca37");
    }

    #[test]
    fn test_generate_without_separator() {
        assert_eq!(
            generate_resource_identifier("abc", "abc", "123456", 16).unwrap(),
            "aba-7c4a8d09ca37"
        );
        assert_eq!(
            generate_resource_identifier("abc", "abc", "123456", 17).unwrap(),
            "abab-7c4a8d09ca37"
        );
    }

    #[test]
    fn test_generate_collapses_double_dashes() {
        let id = generate_resource_identifier("--my--stack", "a", "123456", 30).unwrap();
        assert_eq!(id, "-my-stack-a-7c4a8d09ca37");
    }

    #[test]
    fn test_generate_keeps_leading_dash() {
        let id = generate_resource_identifier("-stack", "a", "123456", 30).unwrap();
        assert_eq!(id, "-stack-a-7c4a8d09ca37");
    }

    #[test]
    fn test_generate_rejects_short_max_length() {
        let err = generate_resource_identifier("abc", "abc", "123456", 14).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Cannot generate resource IDs shorter than 15 characters."
        );
    }

    #[test]
    fn test_fair_split_cases() {
        assert_eq!(fair_split(0, &[10, 10]), vec![0, 0]);
        assert_eq!(fair_split(5, &[1, 10]), vec![1, 4]);
        assert_eq!(fair_split(7, &[3, 3]), vec![3, 3]);
        assert_eq!(fair_split(3, &[10, 10]), vec![2, 1]);
        assert_eq!(fair_split(4, &[]), Vec::<usize>::new());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_fair_split_respects_budget(total in 0usize..200, wants in prop::collection::vec(0usize..100, 0..5)) {
            let shares = fair_split(total, &wants);
            prop_assert_eq!(shares.len(), wants.len());
            for (share, want) in shares.iter().zip(&wants) {
                prop_assert!(share <= want);
            }
            let wanted: usize = wants.iter().sum();
            prop_assert_eq!(shares.iter().sum::<usize>(), total.min(wanted));
        }

        #[test]
        fn test_identifier_is_deterministic_and_bounded(
            stack in "[a-zA-Z][-a-zA-Z0-9]{0,60}",
            logical in "[a-zA-Z][a-zA-Z0-9]{0,60}",
            token in "[a-f0-9-]{1,36}",
            max_length in 15usize..128,
        ) {
            let first = generate_resource_identifier(&stack, &logical, &token, max_length).unwrap();
            let second = generate_resource_identifier(&stack, &logical, &token, max_length).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert!(first.len() <= max_length);
            let expected_hash = &token_hash(&token)[..HASH_LENGTH];
            prop_assert!(first.ends_with(expected_hash));
        }
    }
}
