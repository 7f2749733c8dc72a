use crate::error::ValidationError;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use std::fmt::{self, Display};
use std::str::FromStr;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const MONTHS_FULL: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

pub const MAX_RANGE_MONTHS: u32 = 240;

/// A single accounting period (one calendar month).
///
/// Ordering is chronological since `year` is compared before `month`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year:  i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        ((1..=12).contains(&month) && (1900..=9999).contains(&year)).then_some(Self { year, month })
    }

    #[inline]
    pub fn year(&self) -> i32 {
        self.year
    }

    #[inline]
    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year:  self.year + 1,
                month: 1,
            }
        }
        else {
            Self {
                year:  self.year,
                month: self.month + 1,
            }
        }
    }

    /// Number of months from `self` to `other`, both inclusive. Zero if `other` precedes `self`.
    pub fn months_until(&self, other: &Self) -> u32 {
        let a = self.year as i64 * 12 + self.month as i64;
        let b = other.year as i64 * 12 + other.month as i64;
        if b < a {
            0
        }
        else {
            (b - a + 1) as u32
        }
    }

    fn month_from_name(name: &str) -> Option<u32> {
        MONTHS
            .iter()
            .zip(MONTHS_FULL.iter())
            .position(|(short, full)| name.eq_ignore_ascii_case(short) || name.eq_ignore_ascii_case(full))
            .map(|idx| idx as u32 + 1)
    }

    fn parse_year(s: &str) -> Option<i32> {
        if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse().ok()
        }
        else {
            None
        }
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", MONTHS[self.month as usize - 1], self.year)
    }
}

impl FromStr for Period {
    type Err = ValidationError;

    /// Accepts `Jan 2024`, `January 2024`, `jan-2024` and `2024-01`. Year-only input is not a single period; see
    /// [`PeriodSpec::parse`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let malformed = || ValidationError::MalformedPeriod(raw.to_string());

        let (left, right) = raw
            .split_once(|c: char| c == ' ' || c == '-')
            .map(|(l, r)| (l.trim(), r.trim()))
            .ok_or_else(malformed)?;

        let (year, month) = if let Some(month) = Period::month_from_name(left) {
            (Period::parse_year(right).ok_or_else(malformed)?, month)
        }
        else if let Some(year) = Period::parse_year(left) {
            let month = if right.len() <= 2 && !right.is_empty() && right.bytes().all(|b| b.is_ascii_digit()) {
                right.parse::<u32>().map_err(|_| malformed())?
            }
            else {
                return Err(malformed());
            };
            (year, month)
        }
        else {
            return Err(malformed());
        };

        Period::new(year, month).ok_or_else(malformed)
    }
}

// Periods travel as their canonical `Mon YYYY` text so that they can key JSON maps.
impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The period part of a query: one month or an inclusive range of months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodSpec {
    Single(Period),
    Range { from: Period, to: Period },
}

impl PeriodSpec {
    /// Parse the `from`/`to` pair of a formula call.
    ///
    /// A year-only `from` expands to January of that year and, without an explicit `to`, to December as the upper
    /// bound. A year-only `to` expands to December. A range whose bounds are equal collapses into
    /// [`PeriodSpec::Single`], so `("Jan 2024", "Jan 2024")` and `("Jan 2024", None)` are the same query.
    pub fn parse(from: &str, to: Option<&str>) -> Result<Self, ValidationError> {
        let from = from.trim();
        if from.is_empty() {
            return Err(ValidationError::MissingPeriod);
        }

        let (start, implied_end) = match Period::parse_year(from) {
            Some(year) => {
                let start = Period::new(year, 1).ok_or_else(|| ValidationError::MalformedPeriod(from.to_string()))?;
                (start, Period::new(year, 12))
            }
            None => (from.parse::<Period>()?, None),
        };

        let end = match to.map(str::trim).filter(|t| !t.is_empty()) {
            Some(to) => match Period::parse_year(to) {
                Some(year) => Period::new(year, 12).ok_or_else(|| ValidationError::MalformedPeriod(to.to_string()))?,
                None => to.parse::<Period>()?,
            },
            None => implied_end.unwrap_or(start),
        };

        Self::from_bounds(start, end)
    }

    pub fn from_bounds(from: Period, to: Period) -> Result<Self, ValidationError> {
        if to < from {
            return Err(ValidationError::InvertedRange {
                from: from.to_string(),
                to:   to.to_string(),
            });
        }

        let months = from.months_until(&to);
        if months > MAX_RANGE_MONTHS {
            return Err(ValidationError::RangeTooLong {
                from: from.to_string(),
                to: to.to_string(),
                months,
                max: MAX_RANGE_MONTHS,
            });
        }

        Ok(if from == to {
            Self::Single(from)
        }
        else {
            Self::Range { from, to }
        })
    }

    pub fn first(&self) -> Period {
        match self {
            Self::Single(p) => *p,
            Self::Range { from, .. } => *from,
        }
    }

    pub fn last(&self) -> Period {
        match self {
            Self::Single(p) => *p,
            Self::Range { to, .. } => *to,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Self::Single(_))
    }

    /// Every month covered, in chronological order.
    pub fn months(&self) -> Vec<Period> {
        let last = self.last();
        let mut months = Vec::with_capacity(self.first().months_until(&last) as usize);
        let mut current = self.first();
        loop {
            months.push(current);
            if current == last {
                break;
            }
            current = current.next();
        }
        months
    }
}

impl Display for PeriodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(p) => write!(f, "{p}"),
            Self::Range { from, to } => write!(f, "{from}..{to}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(year: i32, month: u32) -> Period {
        Period::new(year, month).unwrap()
    }

    #[test]
    fn parses_month_spellings() {
        for raw in ["Jan 2024", "january 2024", "JAN-2024", "2024-01", " 2024-1 "] {
            assert_eq!(raw.parse::<Period>(), Ok(p(2024, 1)), "spelling {raw:?}");
        }
        assert_eq!(p(2024, 9).to_string(), "Sep 2024");
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["Janu 2024", "13 2024", "2024-13", "Jan 24", "2024", "Jan"] {
            assert!(
                matches!(raw.parse::<Period>(), Err(ValidationError::MalformedPeriod(_))),
                "accepted {raw:?}"
            );
        }
        assert_eq!(PeriodSpec::parse("  ", None), Err(ValidationError::MissingPeriod));
    }

    #[test]
    fn year_only_expands_to_full_year() {
        let spec = PeriodSpec::parse("2024", None).unwrap();
        assert_eq!(
            spec,
            PeriodSpec::Range {
                from: p(2024, 1),
                to:   p(2024, 12),
            }
        );
        assert_eq!(spec.months().len(), 12);
        assert_eq!(spec.to_string(), "Jan 2024..Dec 2024");

        let spec = PeriodSpec::parse("2023", Some("2024")).unwrap();
        assert_eq!(spec.first(), p(2023, 1));
        assert_eq!(spec.last(), p(2024, 12));
    }

    #[test]
    fn equal_bounds_collapse_to_single() {
        assert_eq!(
            PeriodSpec::parse("Jan 2024", Some("jan 2024")).unwrap(),
            PeriodSpec::parse("2024-01", None).unwrap()
        );
    }

    #[test]
    fn range_bounds_are_checked() {
        assert!(matches!(
            PeriodSpec::parse("Mar 2024", Some("Jan 2024")),
            Err(ValidationError::InvertedRange { .. })
        ));
        assert!(matches!(
            PeriodSpec::parse("Jan 2000", Some("Jan 2030")),
            Err(ValidationError::RangeTooLong { months: 361, .. })
        ));
    }

    #[test]
    fn months_cross_year_boundary() {
        let spec = PeriodSpec::parse("Nov 2023", Some("Feb 2024")).unwrap();
        assert_eq!(spec.months(), vec![p(2023, 11), p(2023, 12), p(2024, 1), p(2024, 2)]);
    }
}
