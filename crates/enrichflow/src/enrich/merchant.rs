/// Merchant recorded when the booking text has no alphanumeric content.
pub const UNKNOWN_MERCHANT: &str = "UNKNOWN";

/// Deterministic merchant name used when the classifier returns none:
/// uppercase, non-alphanumerics become spaces, first three tokens. Never
/// empty.
pub fn fallback_merchant(booking_text: &str) -> String {
    let cleaned: String = booking_text
        .to_uppercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let name = cleaned
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        UNKNOWN_MERCHANT.to_string()
    } else {
        name
    }
}

/// Classifier merchant if present, otherwise the fallback.
pub fn resolve_merchant(classified: Option<&str>, booking_text: &str) -> String {
    match classified.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => m.to_string(),
        None => fallback_merchant(booking_text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_keeps_first_three_tokens() {
        assert_eq!(
            fallback_merchant("Netflix.com*Abo 12/2024 ref:998"),
            "NETFLIX COM ABO"
        );
        assert_eq!(fallback_merchant("rewe-markt"), "REWE MARKT");
    }

    #[test]
    fn symbol_only_text_falls_back_to_unknown() {
        assert_eq!(fallback_merchant("  ***  "), UNKNOWN_MERCHANT);
        assert_eq!(fallback_merchant(""), UNKNOWN_MERCHANT);
        assert_eq!(resolve_merchant(None, "-- / --"), UNKNOWN_MERCHANT);
    }

    #[test]
    fn fallback_keeps_non_ascii_letters() {
        assert_eq!(fallback_merchant("Bäckerei Müller GmbH Filiale 3"), "BÄCKEREI MÜLLER GMBH");
    }

    #[test]
    fn classifier_merchant_wins_when_present() {
        assert_eq!(resolve_merchant(Some(" Netflix "), "whatever"), "Netflix");
        assert_eq!(resolve_merchant(Some(""), "spotify ab"), "SPOTIFY AB");
        assert_eq!(resolve_merchant(None, "spotify ab"), "SPOTIFY AB");
    }
}
