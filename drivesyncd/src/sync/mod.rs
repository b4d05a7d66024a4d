pub mod archive;
pub mod blacklist;
pub mod changes;
pub mod conflict;
pub mod crawler;
pub mod engine;
pub mod paths;
pub mod queue;
pub mod reconcile;
pub mod remote_paths;
pub mod retry;
pub mod transfer;

#[cfg(test)]
pub(crate) mod fake_remote;
