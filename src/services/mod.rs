pub mod academic;
pub mod audit;
pub mod auth;
pub mod configuration;
pub mod coursework;
pub mod email;
pub mod evaluations;
pub mod export;
pub mod guardians;
pub mod messages;
pub mod metrics;
pub mod notifications;
pub mod profiles;
pub mod rbac;
pub mod reports;
pub mod schools;
pub mod secretaries;
pub mod students;
pub mod support;
pub mod teachers;
pub mod users;
pub mod workstreams;
