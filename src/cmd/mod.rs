//! CLI command implementations.
//!
//! | Module     | Commands handled                   |
//! |------------|------------------------------------|
//! | `sessions` | `Status`, `History`, `Clean`       |
//! | `tools`    | `Compact`, `Check`                 |
//! | `config`   | `Config`                           |

pub mod config;
pub mod sessions;
pub mod tools;

pub use config::cmd_config;
pub use sessions::{cmd_clean, cmd_history, cmd_status};
pub use tools::{cmd_check, cmd_compact};
