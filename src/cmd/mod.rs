//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                        |
//! |----------|---------------------------------------------------------|
//! | `worker` | `Worker`                                                |
//! | `run`    | `Start`, `Progress`, `Pause`, `Resume`, `Cancel`, `List`|
//! | `config` | `Config`                                                |

pub mod config;
pub mod run;
pub mod worker;

pub use config::cmd_config;
pub use run::{cmd_list, cmd_progress, cmd_signal, cmd_start};
pub use worker::cmd_worker;
