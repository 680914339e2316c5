//! Text and number normalization applied before keys are built and values
//! compared.

use std::borrow::Cow;

/// Characters produced when accented Spanish text is decoded with the wrong
/// code page upstream.
const REPAIRS: &[(char, &str)] = &[
    ('┴', "A"),
    ('╔', "E"),
    ('═', "I"),
    ('Ë', "O"),
    ('┌', "U"),
    ('Ð', "Ñ"),
    ('"', ""),
    ('\'', " "),
];

/// Replace legacy-encoding artifacts and quote characters.
///
/// Returns `Cow::Borrowed` when the input needed no repair.
pub fn repair_text(value: &str) -> Cow<'_, str> {
    if !value.chars().any(|c| REPAIRS.iter().any(|(bad, _)| *bad == c)) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match REPAIRS.iter().find(|(bad, _)| *bad == c) {
            Some((_, good)) => out.push_str(good),
            None => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Canonical form used for key fields and text comparison: trimmed,
/// upper-cased, with integral decimal codes (`"1234.0"`) reduced to their
/// integer text.
pub fn canonical_text(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(code) = integral_code(trimmed) {
        return code.to_string();
    }
    trimmed.to_uppercase()
}

/// `"1234.000"` -> `"1234"`. Leading zeros are kept; they are significant in
/// client and product codes.
fn integral_code(value: &str) -> Option<&str> {
    let (whole, fraction) = value.split_once('.')?;
    let digits = whole.strip_prefix('-').unwrap_or(whole);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if fraction.is_empty() || !fraction.bytes().all(|b| b == b'0') {
        return None;
    }
    Some(whole)
}

/// Parse a number written with either comma or period decimals.
///
/// - Both separators present: the last one is the decimal separator.
/// - One separator repeated: it groups thousands.
/// - A single comma or period: decimal separator.
///
/// Currency symbols and inner spaces are ignored. Empty input is `None`.
pub fn coerce_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();

    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) if commas > 1 => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        (None, Some(_)) if dots > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Split a `"code - name"` cell. Values without a separator are all code.
pub fn split_code_name(value: &str) -> (String, Option<String>) {
    match value.split_once('-') {
        Some((code, name)) => {
            let name = name.trim();
            (
                code.trim().to_string(),
                (!name.is_empty()).then(|| name.to_string()),
            )
        }
        None => (value.trim().to_string(), None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_maps_code_page_artifacts() {
        assert_eq!(repair_text("MU┌OZ"), "MUUOZ");
        assert_eq!(repair_text("CA┴A"), "CAAA");
        assert_eq!(repair_text("PEÐA"), "PEÑA");
        assert_eq!(repair_text("JOS╔ \"EL\" D'ORO"), "JOSE EL D ORO");
    }

    #[test]
    fn repair_borrows_clean_input() {
        assert!(matches!(repair_text("ACME S.A."), Cow::Borrowed(_)));
    }

    #[test]
    fn canonical_text_trims_and_uppercases() {
        assert_eq!(canonical_text("  acme "), "ACME");
        assert_eq!(canonical_text(" 1234 "), "1234");
        assert_eq!(canonical_text("1234.0"), "1234");
        assert_eq!(canonical_text("1234.00"), "1234");
        assert_eq!(canonical_text("00123.0"), "00123");
    }

    #[test]
    fn canonical_text_keeps_real_decimals_and_mixed_codes() {
        assert_eq!(canonical_text("12.5"), "12.5");
        assert_eq!(canonical_text("a1.0"), "A1.0");
        assert_eq!(canonical_text("1."), "1.");
    }

    #[test]
    fn coerce_number_handles_both_decimal_styles() {
        assert_eq!(coerce_number("1234.56"), Some(1234.56));
        assert_eq!(coerce_number("1234,56"), Some(1234.56));
        assert_eq!(coerce_number("1.234,56"), Some(1234.56));
        assert_eq!(coerce_number("1,234.56"), Some(1234.56));
        assert_eq!(coerce_number("1.234.567"), Some(1234567.0));
        assert_eq!(coerce_number("1,234,567"), Some(1234567.0));
        assert_eq!(coerce_number(" $ -45,5 "), Some(-45.5));
    }

    #[test]
    fn coerce_number_rejects_garbage() {
        assert_eq!(coerce_number(""), None);
        assert_eq!(coerce_number("   "), None);
        assert_eq!(coerce_number("n/a"), None);
        assert_eq!(coerce_number("inf"), None);
    }

    #[test]
    fn split_code_name_variants() {
        assert_eq!(
            split_code_name("101 - ACME LTDA"),
            ("101".to_string(), Some("ACME LTDA".to_string()))
        );
        assert_eq!(split_code_name("101"), ("101".to_string(), None));
        assert_eq!(split_code_name("101 -"), ("101".to_string(), None));
    }
}
