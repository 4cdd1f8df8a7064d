//! Command implementations

pub mod build;
pub mod deploy;
pub mod uninstall;
pub mod verify;
