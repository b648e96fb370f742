//! Time quantums for `time` fields.
//!
//! A time field materialises, besides its standard view, one view per
//! configured granularity with the truncated timestamp baked into the view
//! name (`standard_2017`, `standard_201701`, ...). Queries over a time
//! range union the coarsest set of views covering it; this module only
//! produces the names.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Which granularities a time field materialises. Valid quantums are the
/// contiguous spans `Y`, `YM`, `YMD` and `YMDH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeQuantum {
    pub year: bool,
    pub month: bool,
    pub day: bool,
    pub hour: bool,
}

impl TimeQuantum {
    pub fn is_empty(&self) -> bool {
        !(self.year || self.month || self.day || self.hour)
    }
}

impl std::str::FromStr for TimeQuantum {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "" => Ok(TimeQuantum::default()),
            "Y" => Ok(TimeQuantum { year: true, ..Default::default() }),
            "YM" => Ok(TimeQuantum { year: true, month: true, ..Default::default() }),
            "YMD" => Ok(TimeQuantum { year: true, month: true, day: true, hour: false }),
            "YMDH" => Ok(TimeQuantum { year: true, month: true, day: true, hour: true }),
            other => Err(CoreError::UnknownTimeQuantum(other.to_string())),
        }
    }
}

impl std::fmt::Display for TimeQuantum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.year {
            write!(f, "Y")?;
        }
        if self.month {
            write!(f, "M")?;
        }
        if self.day {
            write!(f, "D")?;
        }
        if self.hour {
            write!(f, "H")?;
        }
        Ok(())
    }
}

/// View names for a timestamp under a quantum, coarsest first.
pub fn views_by_time(base: &str, t: DateTime<Utc>, q: TimeQuantum) -> Vec<String> {
    let mut views = Vec::with_capacity(4);
    if q.year {
        views.push(format!("{base}_{:04}", t.year()));
    }
    if q.month {
        views.push(format!("{base}_{:04}{:02}", t.year(), t.month()));
    }
    if q.day {
        views.push(format!("{base}_{:04}{:02}{:02}", t.year(), t.month(), t.day()));
    }
    if q.hour {
        views.push(format!(
            "{base}_{:04}{:02}{:02}{:02}",
            t.year(),
            t.month(),
            t.day(),
            t.hour()
        ));
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn quantum_parse_round_trip() {
        for s in ["Y", "YM", "YMD", "YMDH"] {
            let q: TimeQuantum = s.parse().unwrap();
            assert_eq!(q.to_string(), s);
        }
        assert!("MD".parse::<TimeQuantum>().is_err());
        assert!("".parse::<TimeQuantum>().unwrap().is_empty());
    }

    #[test]
    fn view_names_truncate_the_timestamp() {
        let t = Utc.with_ymd_and_hms(2017, 1, 2, 3, 4, 5).unwrap();
        let q: TimeQuantum = "YMDH".parse().unwrap();
        assert_eq!(
            views_by_time("standard", t, q),
            vec![
                "standard_2017",
                "standard_201701",
                "standard_20170102",
                "standard_2017010203",
            ]
        );
        let q: TimeQuantum = "YM".parse().unwrap();
        assert_eq!(
            views_by_time("standard", t, q),
            vec!["standard_2017", "standard_201701"]
        );
    }
}
