use chrono::NaiveDate;

const CURRENCY_SYMBOLS: &[char] = &['$', '£', '€', '¥', '₹'];

/// Parses a monetary cell into a signed number.
///
/// Accepts currency symbols and short currency codes, thousands separators,
/// decimal commas (`1.234,56`), parenthesised negatives, leading or trailing
/// minus signs and `CR`/`DR` suffixes. Returns `None` for blanks, placeholders
/// like `-`, and anything whose separators do not read as one unambiguous number.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut text = raw.trim().to_string();
    if text.is_empty() || matches!(text.as_str(), "-" | "--" | "—" | "n/a" | "N/A") {
        return None;
    }

    let mut negative = false;

    let upper = text.to_ascii_uppercase();
    if upper.ends_with("DR") {
        negative = true;
        text.truncate(text.len() - 2);
    } else if upper.ends_with("CR") {
        text.truncate(text.len() - 2);
    }

    let mut text = text.trim().to_string();
    if text.starts_with('(') && text.ends_with(')') && text.len() >= 2 {
        negative = !negative;
        text = text[1..text.len() - 1].to_string();
    }

    // Signs and currency markers can wrap the digits in any order: "-$5", "R -5", "5.00 USD".
    let mut body = text.trim();
    loop {
        let before = body.len();
        if let Some(rest) = body.strip_prefix('-') {
            negative = !negative;
            body = rest.trim_start();
        } else if let Some(rest) = body.strip_prefix('+') {
            body = rest.trim_start();
        }
        if let Some(rest) = body.strip_suffix('-') {
            negative = !negative;
            body = rest.trim_end();
        }
        body = strip_currency_suffix(strip_currency_prefix(body));
        if body.len() == before {
            break;
        }
    }

    let starts_and_ends_with_digit = body.starts_with(|c: char| c.is_ascii_digit())
        && body.ends_with(|c: char| c.is_ascii_digit());
    if !starts_and_ends_with_digit
        || !body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '\'' | ' ' | '\u{a0}'))
    {
        return None;
    }

    let digits: String = body
        .chars()
        .filter(|c| !matches!(c, '\'' | ' ' | '\u{a0}'))
        .collect();
    let value: f64 = resolve_separators(&digits)?.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn strip_currency_prefix(text: &str) -> &str {
    let text = text.trim_start_matches(CURRENCY_SYMBOLS).trim_start();
    let letters = text.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    if (1..=3).contains(&letters) {
        let rest = &text[letters..];
        let rest = rest.strip_prefix('.').unwrap_or(rest);
        if !rest.starts_with(char::is_alphabetic) {
            return rest.trim_start();
        }
    }
    text
}

fn strip_currency_suffix(text: &str) -> &str {
    let text = text.trim_end_matches(CURRENCY_SYMBOLS).trim_end();
    let letters = text
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphabetic())
        .count();
    if (1..=3).contains(&letters) {
        let (rest, code) = text.split_at(text.len() - letters);
        // "5 R" or a glued ISO code like "100EUR"; never a lone letter glued to digits.
        let glued_code = letters == 3 && code.chars().all(|c| c.is_ascii_uppercase());
        if rest.ends_with(char::is_whitespace) || glued_code {
            return rest.trim_end();
        }
    }
    text
}

/// Turns `1.234,56` / `1,234.56` / `12,50` into a plain `1234.56`-style string.
///
/// The last separator is the decimal point when both kinds appear. A lone
/// comma followed by one or two digits is a decimal comma. Every other
/// separator must split the integer part into groups of three.
fn resolve_separators(digits: &str) -> Option<String> {
    let commas = digits.matches(',').count();
    let dots = digits.matches('.').count();

    let (decimal, thousands) = match (commas, dots) {
        (0, 0) => return Some(digits.to_string()),
        (1, 0) if has_short_tail(digits, ',') => (Some(','), None),
        (_, 0) => (None, Some(',')),
        (0, 1) => (Some('.'), None),
        (0, _) => (None, Some('.')),
        _ => match (digits.rfind(','), digits.rfind('.')) {
            (Some(comma), Some(dot)) if comma > dot => (Some(','), Some('.')),
            _ => (Some('.'), Some(',')),
        },
    };

    let (whole, fraction) = match decimal {
        Some(separator) => {
            let (whole, fraction) = digits.rsplit_once(separator)?;
            (whole, Some(fraction))
        }
        None => (digits, None),
    };
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }

    let whole = match thousands {
        Some(separator) => {
            let groups: Vec<&str> = whole.split(separator).collect();
            let well_grouped = groups.iter().enumerate().all(|(i, group)| {
                let width_ok = if i == 0 {
                    (1..=3).contains(&group.len())
                } else {
                    group.len() == 3
                };
                width_ok && group.chars().all(|c| c.is_ascii_digit())
            });
            if !well_grouped {
                return None;
            }
            groups.concat()
        }
        None => whole.to_string(),
    };
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(match fraction {
        Some(fraction) => format!("{}.{}", whole, fraction),
        None => whole,
    })
}

fn has_short_tail(digits: &str, separator: char) -> bool {
    digits
        .rsplit_once(separator)
        .is_some_and(|(_, tail)| (1..=2).contains(&tail.len()))
}

/// Calendar month bucket, e.g. `2023-01`.
pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// ISO week bucket, e.g. `2023-W01`.
pub fn week_key(date: NaiveDate) -> String {
    date.format("%G-W%V").to_string()
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strips spaces, dashes and dots so that `12-3456 78` and `12345678` match.
pub fn normalize_account_number(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '.' | '/'))
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount("1,234.50"), Some(1234.5));
        assert_eq!(parse_amount("$ 99.99"), Some(99.99));
        assert_eq!(parse_amount("(12.00)"), Some(-12.0));
        assert_eq!(parse_amount("-45"), Some(-45.0));
        assert_eq!(parse_amount("45-"), Some(-45.0));
        assert_eq!(parse_amount("300.00 DR"), Some(-300.0));
        assert_eq!(parse_amount("300.00 CR"), Some(300.0));
        assert_eq!(parse_amount("-$5"), Some(-5.0));
        assert_eq!(parse_amount("100.00 USD"), Some(100.0));
        assert_eq!(parse_amount("1,234,567"), Some(1234567.0));
    }

    #[test]
    fn test_parse_amount_decimal_commas() {
        assert_eq!(parse_amount("12,50"), Some(12.5));
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("R 1 500,00"), Some(1500.0));
        assert_eq!(parse_amount("€ 1.234.567,8"), Some(1234567.8));
        assert_eq!(parse_amount("(1.050,00)"), Some(-1050.0));
    }

    #[test]
    fn test_parse_amount_rejects_ambiguous_separators() {
        assert_eq!(parse_amount("1e5"), None);
        assert_eq!(parse_amount("1,2,3"), None);
        assert_eq!(parse_amount("1.234.56"), None);
        assert_eq!(parse_amount("12,5,00"), None);
        assert_eq!(parse_amount("cheque 1234"), None);
    }

    #[test]
    fn test_parse_amount_rejects_non_numbers() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("-"), None);
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount("opening balance"), None);
        assert_eq!(parse_amount("12abc34"), None);
    }

    #[test]
    fn test_period_keys() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        assert_eq!(month_key(date), "2023-01");
        assert_eq!(week_key(date), "2023-W01");

        // Jan 1 2023 is a Sunday and belongs to the last ISO week of 2022.
        let sunday = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        assert_eq!(week_key(sunday), "2022-W52");
    }

    #[test]
    fn test_normalize_account_number() {
        assert_eq!(
            normalize_account_number(" 12-3456 78 "),
            Some("12345678".to_string())
        );
        assert_eq!(normalize_account_number(" - "), None);
    }
}
