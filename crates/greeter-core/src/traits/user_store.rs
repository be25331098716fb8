//! UserStore trait: read-only access to user records.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{MonthDay, User};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Non-deleted users whose birthday or anniversary falls on `month_day`.
    async fn find_users_with_occurrence_on(&self, month_day: MonthDay) -> Result<Vec<User>>;

    /// Look up a single user, including soft-deleted ones.
    async fn get_user(&self, id: &str) -> Result<Option<User>>;
}
