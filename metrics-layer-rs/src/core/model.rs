//! Models: connection, week start, mappings and access grants for a set of views

use std::collections::BTreeMap;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeekStartDay {
    #[default]
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl WeekStartDay {
    /// Days to shift a date forward so that a Monday-based truncation lands on
    /// this start day. Monday needs no shift.
    pub fn offset(&self) -> Option<u32> {
        match self {
            WeekStartDay::Monday => None,
            WeekStartDay::Sunday => Some(1),
            WeekStartDay::Saturday => Some(2),
            WeekStartDay::Friday => Some(3),
            WeekStartDay::Thursday => Some(4),
            WeekStartDay::Wednesday => Some(5),
            WeekStartDay::Tuesday => Some(6),
        }
    }

    pub fn weekday(&self) -> Weekday {
        match self {
            WeekStartDay::Monday => Weekday::Mon,
            WeekStartDay::Tuesday => Weekday::Tue,
            WeekStartDay::Wednesday => Weekday::Wed,
            WeekStartDay::Thursday => Weekday::Thu,
            WeekStartDay::Friday => Weekday::Fri,
            WeekStartDay::Saturday => Weekday::Sat,
            WeekStartDay::Sunday => Weekday::Sun,
        }
    }
}

/// Cross-view field equivalence, e.g. `source` mapped to two columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub fields: Vec<String>,
    pub group_label: Option<String>,
    pub description: Option<String>,
}

/// Named access rule checked against a user attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub name: String,
    pub user_attribute: String,
    pub allowed_values: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    /// Connection name resolved against the configured connections
    pub connection: Option<String>,
    pub week_start_day: Option<WeekStartDay>,
    /// IANA timezone that time columns are converted to
    pub timezone: Option<String>,
    #[serde(default = "default_true")]
    pub default_convert_timezone: bool,
    #[serde(default)]
    pub mappings: BTreeMap<String, Mapping>,
    #[serde(default)]
    pub access_grants: Vec<AccessGrant>,
    #[serde(default)]
    pub required_access_grants: Vec<String>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: None,
            week_start_day: None,
            timezone: None,
            default_convert_timezone: true,
            mappings: BTreeMap::new(),
            access_grants: Vec::new(),
            required_access_grants: Vec::new(),
        }
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn with_week_start_day(mut self, day: WeekStartDay) -> Self {
        self.week_start_day = Some(day);
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_mapping(mut self, name: impl Into<String>, fields: Vec<String>) -> Self {
        self.mappings.insert(
            name.into(),
            Mapping {
                fields,
                group_label: None,
                description: None,
            },
        );
        self
    }

    pub fn with_access_grant(
        mut self,
        name: impl Into<String>,
        user_attribute: impl Into<String>,
        allowed_values: Vec<String>,
    ) -> Self {
        self.access_grants.push(AccessGrant {
            name: name.into(),
            user_attribute: user_attribute.into(),
            allowed_values,
        });
        self
    }

    pub fn get_access_grant(&self, name: &str) -> Option<&AccessGrant> {
        self.access_grants.iter().find(|g| g.name == name)
    }
}
