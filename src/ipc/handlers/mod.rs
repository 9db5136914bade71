pub mod attendance;
pub mod auth;
pub mod backup;
pub mod core;
pub mod courses;
pub mod evaluations;
pub mod lessons;
pub mod reports;
pub mod skills;
pub mod students;
pub mod users;
