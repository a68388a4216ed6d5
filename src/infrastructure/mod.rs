pub mod config;
pub mod credential_store;
pub mod error;
pub mod event_mapper;
pub mod event_store;
pub mod google_calendar_client;
pub mod job_store;
pub mod kv_store;
pub mod logging;
pub mod oauth_client;
pub mod quota_tracker;
pub mod storage;
