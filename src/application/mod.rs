pub mod bootstrap;
pub mod calendar_sync;
pub mod conflict_resolver;
pub mod idempotency;
pub mod job_queue;
pub mod oauth;
pub mod queue_monitor;
pub mod remote_calendar;

#[cfg(test)]
pub(crate) mod test_support;
