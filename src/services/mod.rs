pub mod assignments;
pub mod coverage_sync;
pub mod events;
pub mod init;
pub mod locks;
pub mod notifications;
pub mod planning;
pub mod recurrence;
pub mod series;
pub mod spike_expiry;
pub mod sweep;

#[cfg(test)]
pub(crate) mod fixtures;
