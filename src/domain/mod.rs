pub mod job;
pub mod models;
