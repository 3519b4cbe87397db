//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                                         |
//! |--------------|----------------------------------------------------------|
//! | `serve`      | `Serve`                                                  |
//! | `automation` | `InitDb`, `Step`, `Create`, `Stop`, `Reset`, `Status`    |
//! | `config`     | `Config`                                                 |

pub mod automation;
pub mod config;
pub mod serve;

pub use automation::{cmd_create, cmd_init_db, cmd_reset, cmd_status, cmd_step, cmd_stop};
pub use config::cmd_config;
pub use serve::cmd_serve;
