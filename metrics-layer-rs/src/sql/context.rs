//! Per-compilation settings shared by every stage of one query

use std::cell::RefCell;
use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use super::dialect::Dialect;
use crate::core::WeekStartDay;
use crate::error::{MetricsLayerError, Result};

#[derive(Debug)]
pub struct CompileContext {
    pub dialect: Dialect,
    /// Timezone time columns are converted into
    pub timezone: Option<String>,
    pub convert_timezone_default: bool,
    pub week_start_day: WeekStartDay,
    /// Current instant in the query timezone, used by relative date filters
    pub now: NaiveDateTime,
    pub user_attributes: BTreeMap<String, String>,
    pub strict_symmetric_aggregates: bool,
    pub suppress_warnings: bool,
    warnings: RefCell<Vec<String>>,
}

impl CompileContext {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            timezone: None,
            convert_timezone_default: true,
            week_start_day: WeekStartDay::Monday,
            now: Utc::now().naive_utc(),
            user_attributes: BTreeMap::new(),
            strict_symmetric_aggregates: false,
            suppress_warnings: false,
            warnings: RefCell::new(Vec::new()),
        }
    }

    pub fn with_timezone(mut self, timezone: Option<String>) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_week_start_day(mut self, day: WeekStartDay) -> Self {
        self.week_start_day = day;
        self
    }

    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = now;
        self
    }

    pub fn with_user_attributes(mut self, user_attributes: BTreeMap<String, String>) -> Self {
        self.user_attributes = user_attributes;
        self
    }

    pub fn with_strict_symmetric_aggregates(mut self, strict: bool) -> Self {
        self.strict_symmetric_aggregates = strict;
        self
    }

    /// Same settings for another dialect, with a fresh warning list
    pub fn for_dialect(&self, dialect: Dialect) -> Self {
        Self {
            dialect,
            timezone: self.timezone.clone(),
            convert_timezone_default: self.convert_timezone_default,
            week_start_day: self.week_start_day,
            now: self.now,
            user_attributes: self.user_attributes.clone(),
            strict_symmetric_aggregates: self.strict_symmetric_aggregates,
            suppress_warnings: self.suppress_warnings,
            warnings: RefCell::new(Vec::new()),
        }
    }

    /// Records a warning for the compiled query; duplicates are dropped
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        if !self.suppress_warnings {
            warn!("{message}");
        }
        let mut warnings = self.warnings.borrow_mut();
        if !warnings.contains(&message) {
            warnings.push(message);
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.borrow().clone()
    }
}

/// Current wall-clock time in `timezone`, or UTC when none is given
pub fn now_in_timezone(timezone: Option<&str>) -> Result<NaiveDateTime> {
    let now = Utc::now();
    match timezone {
        Some(name) => {
            let tz: Tz = name
                .parse()
                .map_err(|_| MetricsLayerError::Query(format!("Unknown timezone {name}")))?;
            Ok(now.with_timezone(&tz).naive_local())
        }
        None => Ok(now.naive_utc()),
    }
}
