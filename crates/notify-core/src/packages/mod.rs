//! Event packages shipped with the agent

pub mod dialog;

pub use dialog::DialogPackage;
