//! SeaORM entities backing [`SeaOrmStore`](super::SeaOrmStore).
//!
//! Identifiers are stored as text and timestamps as Unix milliseconds; the
//! conversions into [`Task`] and [`Profile`] validate both.

pub mod avatar;
pub mod profile;
pub mod task;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::messages::{Profile, Task};
use crate::store::StoreError;

fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid identifier `{raw}`")))
}

fn parse_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

impl TryFrom<task::Model> for Task {
    type Error = StoreError;

    fn try_from(model: task::Model) -> Result<Self, Self::Error> {
        Ok(Task {
            id: parse_id(&model.id)?,
            title: model.title,
            description: model.description,
            completed: model.completed,
            created_at: parse_millis(model.created_at)?,
            updated_at: parse_millis(model.updated_at)?,
            owner: parse_id(&model.user_id)?,
        })
    }
}

impl TryFrom<profile::Model> for Profile {
    type Error = StoreError;

    fn try_from(model: profile::Model) -> Result<Self, Self::Error> {
        Ok(Profile {
            id: parse_id(&model.id)?,
            full_name: model.full_name,
            avatar_url: model.avatar_url,
            updated_at: model.updated_at.map(parse_millis).transpose()?,
        })
    }
}
