//! ISBN normalization, checksum validation and ISBN-10/13 conversion.
//!
//! Everything here is pure. Validation failures are reported as `false` or
//! `None`, never as errors.

use once_cell::sync::Lazy;
use regex::Regex;

static ISBN10_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{9}[\dX]$").expect("static ISBN-10 pattern"));

/// Strips everything except digits and `x`/`X`, upper-casing the check character.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == 'x' || *c == 'X')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn digit(c: u8) -> u32 {
    (c - b'0') as u32
}

fn all_digits(code: &str) -> bool {
    !code.is_empty() && code.bytes().all(|b| b.is_ascii_digit())
}

/// Weighted sum `Σ (10-i)*d[i]` for the first nine digits.
fn isbn10_partial_sum(first_nine: &[u8]) -> u32 {
    first_nine
        .iter()
        .enumerate()
        .map(|(i, b)| (10 - i as u32) * digit(*b))
        .sum()
}

/// ISBN-13 check digit over the first twelve digits.
fn isbn13_check_digit(first_twelve: &[u8]) -> u32 {
    let sum: u32 = first_twelve
        .iter()
        .enumerate()
        .map(|(i, b)| digit(*b) * if i % 2 == 0 { 1 } else { 3 })
        .sum();
    (10 - sum % 10) % 10
}

pub fn is_valid_isbn10(code: &str) -> bool {
    if code.len() != 10 || !ISBN10_SHAPE.is_match(code) {
        return false;
    }
    let bytes = code.as_bytes();
    let last = if bytes[9] == b'X' { 10 } else { digit(bytes[9]) };
    (isbn10_partial_sum(&bytes[..9]) + last) % 11 == 0
}

pub fn is_valid_isbn13(code: &str) -> bool {
    if code.len() != 13 || !all_digits(code) {
        return false;
    }
    let bytes = code.as_bytes();
    isbn13_check_digit(&bytes[..12]) == digit(bytes[12])
}

/// `978` + first nine digits + a freshly computed ISBN-13 check digit.
pub fn isbn10_to_13(isbn10: &str) -> Option<String> {
    if isbn10.len() != 10 {
        return None;
    }
    let body = &isbn10[..9];
    if !all_digits(body) {
        return None;
    }
    let stem = format!("978{}", body);
    let check = isbn13_check_digit(stem.as_bytes());
    Some(format!("{}{}", stem, check))
}

/// Only `978`-prefixed ISBN-13s have an ISBN-10 form.
pub fn isbn13_to_10(isbn13: &str) -> Option<String> {
    if isbn13.len() != 13 || !isbn13.starts_with("978") || !all_digits(isbn13) {
        return None;
    }
    let body = &isbn13[3..12];
    let remainder = (11 - isbn10_partial_sum(body.as_bytes()) % 11) % 11;
    let check = if remainder == 10 {
        'X'
    } else {
        char::from_digit(remainder, 10)?
    };
    Some(format!("{}{}", body, check))
}

/// Ordered, de-duplicated identifiers to try for one scanned code.
///
/// A 13-digit `978`/`979` code goes first, then its ISBN-10 form; a 10-character
/// code goes after its ISBN-13 form. Anything else is tried as-is.
pub fn lookup_candidates_from_barcode(raw: &str) -> Vec<String> {
    let code = normalize(raw);
    let mut candidates: Vec<String> = Vec::with_capacity(2);
    let mut push = |c: String| {
        if !c.is_empty() && !candidates.contains(&c) {
            candidates.push(c);
        }
    };

    if code.len() == 13 && all_digits(&code) && (code.starts_with("978") || code.starts_with("979")) {
        push(code.clone());
        if let Some(isbn10) = isbn13_to_10(&code) {
            push(isbn10);
        }
    } else if code.len() == 10 {
        if let Some(isbn13) = isbn10_to_13(&code) {
            push(isbn13);
        }
        push(code);
    } else {
        push(code);
    }

    candidates
}

/// Whether a candidate may be sent to the lookup service: it passed a
/// checksum, or it is at least purely numeric.
pub fn is_queryable_candidate(candidate: &str) -> bool {
    is_valid_isbn10(candidate) || is_valid_isbn13(candidate) || all_digits(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worked_example() {
        assert!(is_valid_isbn10("0306406152"));
        assert_eq!(isbn10_to_13("0306406152").as_deref(), Some("9780306406157"));
        assert!(is_valid_isbn13("9780306406157"));
        assert_eq!(isbn13_to_10("9780306406157").as_deref(), Some("0306406152"));
    }

    #[test]
    fn test_isbn10_with_x_check() {
        // 080442957X is a well-known valid ISBN-10 ending in X
        assert!(is_valid_isbn10("080442957X"));
        assert_eq!(isbn13_to_10("9780804429573").as_deref(), Some("080442957X"));
        assert_eq!(isbn10_to_13("080442957X").as_deref(), Some("9780804429573"));
    }

    #[test]
    fn test_invalid_checksums() {
        assert!(!is_valid_isbn10("0306406153"));
        assert!(!is_valid_isbn10("03064061"));
        assert!(!is_valid_isbn10("X306406152"));
        assert!(!is_valid_isbn13("9780306406158"));
        assert!(!is_valid_isbn13("978030640615X"));
    }

    #[test]
    fn test_conversion_rejects_bad_shapes() {
        assert_eq!(isbn10_to_13("12345"), None);
        assert_eq!(isbn13_to_10("9790306406157"), None);
        assert_eq!(isbn13_to_10("978030640615"), None);
    }

    #[test]
    fn test_conversions_are_inverse() {
        for isbn10 in ["0306406152", "080442957X", "0451524934", "0143127748"] {
            assert!(is_valid_isbn10(isbn10), "{isbn10}");
            let isbn13 = isbn10_to_13(isbn10).unwrap();
            assert!(is_valid_isbn13(&isbn13), "{isbn13}");
            assert_eq!(isbn13_to_10(&isbn13).as_deref(), Some(isbn10));
        }
    }

    #[test]
    fn test_normalize_strips_noise_and_is_idempotent() {
        assert_eq!(normalize(" 0-8044-2957-x "), "080442957X");
        assert_eq!(normalize("ISBN 978-0-306-40615-7"), "9780306406157");
        assert_eq!(normalize("abc"), "");
        for s in ["", "x-x-1", "978 0306 406157", "isbn:0306406152", "ñ9x"] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_candidates_for_isbn13() {
        assert_eq!(
            lookup_candidates_from_barcode("978-0-306-40615-7"),
            vec!["9780306406157".to_string(), "0306406152".to_string()]
        );
        // 979 has no ISBN-10 counterpart
        assert_eq!(
            lookup_candidates_from_barcode("9791032305690"),
            vec!["9791032305690".to_string()]
        );
    }

    #[test]
    fn test_candidates_for_isbn10() {
        assert_eq!(
            lookup_candidates_from_barcode("0306406152"),
            vec!["9780306406157".to_string(), "0306406152".to_string()]
        );
    }

    #[test]
    fn test_candidates_other_lengths() {
        assert_eq!(lookup_candidates_from_barcode("12345678901"), vec!["12345678901".to_string()]);
        assert!(lookup_candidates_from_barcode("---").is_empty());
    }

    #[test]
    fn test_candidates_never_duplicate() {
        for raw in ["9780306406157", "0306406152", "080442957X", "1234567890", "9781234567897"] {
            let c = lookup_candidates_from_barcode(raw);
            assert!(c.len() <= 2);
            let mut dedup = c.clone();
            dedup.dedup();
            assert_eq!(dedup.len(), c.len());
        }
    }

    #[test]
    fn test_queryable_candidate() {
        assert!(is_queryable_candidate("0306406152"));
        assert!(is_queryable_candidate("080442957X"));
        assert!(is_queryable_candidate("12345678901"));
        assert!(!is_queryable_candidate("12345X78901"));
    }
}
