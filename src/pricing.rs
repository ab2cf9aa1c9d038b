use once_cell::sync::Lazy;
use regex_lite::Regex;

static NUMERIC_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("numeric token pattern"));

const CURRENCY_SYMBOLS: &[char] = &['£', '$', '€'];

/// Extracts a numeric price from free-form price text such as
/// `"Fixed Price £250,000"` or `"Offers Over £180k"`.
///
/// The first numeric token wins. A `k` anywhere in the lowercased text scales
/// by a thousand, otherwise an `m` scales by a million. `None` means the price
/// is unknown, not that parsing failed.
///
/// Range-style text (`"£200,000–£220,000"`) yields the first bound.
pub fn parse_price(price_text: &str) -> Option<f64> {
    let cleaned: String = price_text
        .to_lowercase()
        .chars()
        .filter(|ch| *ch != ',' && !CURRENCY_SYMBOLS.contains(ch))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    let token = NUMERIC_TOKEN.find(cleaned)?;
    let mut value: f64 = token.as_str().parse().ok()?;

    if cleaned.contains('k') {
        value *= 1_000.0;
    } else if cleaned.contains('m') {
        value *= 1_000_000.0;
    }

    Some(value)
}
