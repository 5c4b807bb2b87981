pub mod args;
pub mod commands;
pub mod template;

// Re-export commonly used items
pub use args::{Cli, Commands};
pub use commands::execute_command;
