//! Monthly time axis.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AquiferError, Result};

/// A calendar month. Ordering is chronological; serialized as `"YYYY-MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    pub year: i32,
    /// 1..=12
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(AquiferError::InvalidDate(format!("{year}-{month}: month out of range")));
        }
        Ok(Self { year, month })
    }

    /// Months since year 0, used for arithmetic.
    fn ordinal(self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    fn from_ordinal(n: i64) -> Self {
        Self { year: n.div_euclid(12) as i32, month: (n.rem_euclid(12) + 1) as u32 }
    }

    pub fn succ(self) -> Self {
        self.add_months(1)
    }

    pub fn add_months(self, n: i64) -> Self {
        Self::from_ordinal(self.ordinal() + n)
    }

    /// Signed month count from `self` to `other`.
    pub fn months_until(self, other: YearMonth) -> i64 {
        other.ordinal() - self.ordinal()
    }

    /// Zero-based calendar month index (January = 0).
    pub fn month_index(self) -> usize {
        (self.month - 1) as usize
    }

    /// Every month from `start` to `end`, inclusive. Empty when `end < start`.
    pub fn range_inclusive(start: YearMonth, end: YearMonth) -> Vec<YearMonth> {
        let n = start.months_until(end);
        if n < 0 {
            return Vec::new();
        }
        (0..=n).map(|i| start.add_months(i)).collect()
    }

    /// Substitute `{yyyy}` and `{mm}` in a path template.
    pub fn fill_template(self, template: &str) -> String {
        template
            .replace("{yyyy}", &format!("{:04}", self.year))
            .replace("{mm}", &format!("{:02}", self.month))
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = AquiferError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || AquiferError::InvalidDate(format!("'{s}' is not YYYY-MM"));
        let (y, m) = s.trim().split_once('-').ok_or_else(bad)?;
        let year: i32 = y.parse().map_err(|_| bad())?;
        let month: u32 = m.parse().map_err(|_| bad())?;
        YearMonth::new(year, month)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = AquiferError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<YearMonth> for String {
    fn from(ym: YearMonth) -> String {
        ym.to_string()
    }
}
