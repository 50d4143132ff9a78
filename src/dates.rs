//! Forward-only repair of free-text date columns.
//!
//! Statement tables routinely print the year once (or not at all) and then
//! list rows as `Feb 2`, `02 Feb` and so on. The normalizer walks the column
//! once, top to bottom, carrying the last year and the last date it managed
//! to parse, and never looks ahead.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::sync::LazyLock;

/// Year appended to year-less inputs so chrono can parse them. A parsed date
/// carrying it means "the year is unknown" (1904 is a leap year so Feb 29 survives).
pub const PLACEHOLDER_YEAR: i32 = 1904;

const MIN_PLAUSIBLE_YEAR: i32 = 1950;
const MAX_PLAUSIBLE_YEAR: i32 = 2200;

const FULL_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%m-%d-%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%m/%d/%y",
    "%d/%m/%y",
    "%b %d %Y",
    "%d %b %Y",
    "%d-%b-%Y",
    "%b-%d-%Y",
    "%b %d %y",
    "%d %b %y",
    "%d-%b-%y",
    "%Y %b %d",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S%z"];

const MONTH_ABBREVIATIONS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const PARTIAL_DATE_FORMATS: &[&str] = &["%b %d", "%d %b", "%d-%b", "%b-%d", "%m/%d"];

static ORDINAL_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").expect("valid regex"));

static WEEKDAY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun)[a-z]*\.?,?\s+")
        .expect("valid regex")
});

/// Full or abbreviated month names, rewritten to the three-letter form `%b` parses.
static MONTH_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\b\.?",
    )
    .expect("valid regex")
});

static MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2})\b(?:\s+(\d{4})\b)?",
    )
    .expect("valid regex")
});

static DAY_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\b(?:\s+(\d{4})\b)?",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parsed {
    Full(NaiveDate),
    /// Month and day only; the year has to come from context.
    YearUnknown { month: u32, day: u32 },
}

/// Stateful single-pass scanner. Feed it cells in column order.
#[derive(Debug, Default, Clone)]
pub struct DateNormalizer {
    last_year: Option<i32>,
    last_date: Option<NaiveDate>,
}

impl DateNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, raw: Option<&str>) -> Option<NaiveDate> {
        let cleaned = raw.map(clean).unwrap_or_default();

        match fuzzy_parse(&cleaned) {
            Some(Parsed::Full(date)) => {
                self.last_year = Some(date.year());
                self.last_date = Some(date);
                Some(date)
            }
            Some(Parsed::YearUnknown { month, day }) => self.with_inferred_year(month, day),
            None => match partial_month_day(&cleaned) {
                Some(PartialMatch {
                    month,
                    day,
                    year: Some(year),
                }) => match NaiveDate::from_ymd_opt(year, month, day).and_then(plausible) {
                    Some(date) => {
                        self.last_year = Some(year);
                        self.last_date = Some(date);
                        Some(date)
                    }
                    None => self.with_inferred_year(month, day),
                },
                Some(PartialMatch { month, day, .. }) => self.with_inferred_year(month, day),
                None => self.last_date,
            },
        }
    }

    fn with_inferred_year(&mut self, month: u32, day: u32) -> Option<NaiveDate> {
        match self
            .last_year
            .and_then(|year| NaiveDate::from_ymd_opt(year, month, day))
        {
            Some(date) => {
                self.last_date = Some(date);
                Some(date)
            }
            None => self.last_date,
        }
    }
}

/// Normalizes a whole column. Output is one-to-one with the input.
pub fn normalize_dates<S: AsRef<str>>(raw: &[Option<S>]) -> Vec<Option<NaiveDate>> {
    let mut normalizer = DateNormalizer::new();
    raw.iter()
        .map(|value| normalizer.advance(value.as_ref().map(|s| s.as_ref())))
        .collect()
}

fn clean(raw: &str) -> String {
    let text = raw.trim().replace(',', " ");
    let text = WEEKDAY_PREFIX.replace(&text, "");
    let text = ORDINAL_SUFFIX.replace_all(&text, "$1");
    let text = MONTH_NAME.replace_all(&text, |caps: &regex::Captures| {
        month_number(&caps[1])
            .map(|month| MONTH_ABBREVIATIONS[month as usize - 1].to_string())
            .unwrap_or_else(|| caps[0].to_string())
    });
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches('.')
        .to_string()
}

fn fuzzy_parse(text: &str) -> Option<Parsed> {
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return plausible(dt.date_naive()).map(Parsed::Full);
    }
    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return plausible(dt.date_naive()).map(Parsed::Full);
        }
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return plausible(dt.date()).map(Parsed::Full);
        }
    }

    for format in FULL_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            if let Some(date) = plausible(date) {
                return Some(Parsed::Full(date));
            }
        }
    }

    let with_placeholder = format!("{} {}", text, PLACEHOLDER_YEAR);
    for format in PARTIAL_DATE_FORMATS {
        let format = format!("{} %Y", format);
        if let Ok(date) = NaiveDate::parse_from_str(&with_placeholder, &format) {
            if date.year() == PLACEHOLDER_YEAR {
                return Some(Parsed::YearUnknown {
                    month: date.month(),
                    day: date.day(),
                });
            }
        }
    }

    None
}

fn plausible(date: NaiveDate) -> Option<NaiveDate> {
    if (MIN_PLAUSIBLE_YEAR..=MAX_PLAUSIBLE_YEAR).contains(&date.year()) {
        Some(date)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartialMatch {
    month: u32,
    day: u32,
    /// Four-digit year printed right after the day, if any.
    year: Option<i32>,
}

/// Last-chance `<Month> <Day> [Year]` (or `<Day> <Month> [Year]`) search anywhere in the text.
fn partial_month_day(text: &str) -> Option<PartialMatch> {
    if let Some(caps) = MONTH_DAY.captures(text) {
        return Some(PartialMatch {
            month: month_number(caps.get(1)?.as_str())?,
            day: caps.get(2)?.as_str().parse().ok()?,
            year: caps.get(3).and_then(|y| y.as_str().parse().ok()),
        });
    }
    if let Some(caps) = DAY_MONTH.captures(text) {
        return Some(PartialMatch {
            month: month_number(caps.get(2)?.as_str())?,
            day: caps.get(1)?.as_str().parse().ok()?,
            year: caps.get(3).and_then(|y| y.as_str().parse().ok()),
        });
    }
    None
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_lowercase().get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}
