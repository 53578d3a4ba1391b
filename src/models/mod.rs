pub mod academic;
pub mod activity;
pub mod auth;
pub mod configuration;
pub mod coursework;
pub mod guardian;
pub mod message;
pub mod notification;
pub mod report;
pub mod school;
pub mod secretary;
pub mod student;
pub mod support;
pub mod teacher;
pub mod user;
pub mod workstream;

use serde::{Deserialize, Deserializer};

/// Lets update requests tell an explicit `null` (clear the field) apart from an
/// absent key (leave it unchanged). Use with `#[serde(default)]`.
pub fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}
