pub mod archives;
pub mod documents;
pub mod files;
pub mod health;
pub mod uploads;
