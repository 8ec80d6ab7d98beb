pub mod ai;
pub mod config;
pub mod git;
pub mod host;
pub mod ipc;
pub mod model;
pub mod protocol;
pub mod store;
pub mod worktree;

#[cfg(test)]
pub(crate) mod test_support;
