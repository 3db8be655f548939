//! Asynchronous subprocess execution for the external tooling (`kustomize`, `kubectl`)
//! the broker drives.

pub mod process;
