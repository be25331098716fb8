//! Domain types shared by the scheduler, the channels and the gateway.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GreeterError;

/// Kind of recurring message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Birthday,
    Anniversary,
}

impl MessageType {
    pub const ALL: [MessageType; 2] = [MessageType::Birthday, MessageType::Anniversary];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Birthday => "BIRTHDAY",
            MessageType::Anniversary => "ANNIVERSARY",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = GreeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BIRTHDAY" => Ok(MessageType::Birthday),
            "ANNIVERSARY" => Ok(MessageType::Anniversary),
            other => Err(GreeterError::Validation(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

/// A calendar month + day, independent of year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Self {
        Self { month, day }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            day: date.day(),
        }
    }

    pub fn is_leap_day(&self) -> bool {
        self.month == 2 && self.day == 29
    }

    /// The concrete date of this month-day in `year`.
    /// Feb 29 falls back to Feb 28 in non-leap years.
    pub fn in_year(&self, year: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day).or_else(|| {
            if self.is_leap_day() {
                NaiveDate::from_ymd_opt(year, 2, 28)
            } else {
                None
            }
        })
    }

    /// Month-days whose occurrence lands on `date`: the date's own month-day,
    /// plus Feb 29 when `date` is Feb 28 of a non-leap year.
    pub fn celebrated_on(date: NaiveDate) -> Vec<MonthDay> {
        let own = MonthDay::from_date(date);
        let mut days = vec![own];
        if own == MonthDay::new(2, 28) && NaiveDate::from_ymd_opt(date.year(), 2, 29).is_none() {
            days.push(MonthDay::new(2, 29));
        }
        days
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

/// A user record, owned by the user-management API. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// IANA timezone id, e.g. "America/New_York".
    pub timezone: String,
    pub birthday_date: Option<NaiveDate>,
    pub anniversary_date: Option<NaiveDate>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// The original date of the event behind `message_type`, if the user has one.
    pub fn event_date(&self, message_type: MessageType) -> Option<NaiveDate> {
        match message_type {
            MessageType::Birthday => self.birthday_date,
            MessageType::Anniversary => self.anniversary_date,
        }
    }

    pub fn contact(&self) -> Contact {
        Contact {
            user_id: self.id.clone(),
            name: self.full_name(),
            email: self.email.clone(),
        }
    }
}

/// Who a message is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_message_type_round_trip_names() {
        for mt in MessageType::ALL {
            assert_eq!(mt.as_str().parse::<MessageType>().unwrap(), mt);
        }
        assert!("GRADUATION".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_leap_day_in_non_leap_year() {
        let md = MonthDay::new(2, 29);
        assert_eq!(md.in_year(2024), Some(date(2024, 2, 29)));
        assert_eq!(md.in_year(2025), Some(date(2025, 2, 28)));
    }

    #[test]
    fn test_celebrated_on_feb_28() {
        assert_eq!(
            MonthDay::celebrated_on(date(2025, 2, 28)),
            vec![MonthDay::new(2, 28), MonthDay::new(2, 29)]
        );
        assert_eq!(
            MonthDay::celebrated_on(date(2024, 2, 28)),
            vec![MonthDay::new(2, 28)]
        );
        assert_eq!(
            MonthDay::celebrated_on(date(2024, 7, 4)),
            vec![MonthDay::new(7, 4)]
        );
    }

    #[test]
    fn test_user_helpers() {
        let user = User {
            id: "u1".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            timezone: "Europe/London".into(),
            birthday_date: Some(date(1815, 12, 10)),
            anniversary_date: None,
            deleted_at: None,
        };
        assert_eq!(user.full_name(), "Ada Lovelace");
        assert_eq!(user.event_date(MessageType::Birthday), Some(date(1815, 12, 10)));
        assert_eq!(user.event_date(MessageType::Anniversary), None);
        assert!(!user.is_deleted());
        assert_eq!(user.contact().email, "ada@example.com");
        assert_eq!(MonthDay::from_date(date(1815, 12, 10)).to_string(), "12-10");
    }
}
