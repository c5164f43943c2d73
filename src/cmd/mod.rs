//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `analyze` | `Analyze`        |
//! | `engines` | `Engines`        |
//! | `config`  | `Config`         |

pub mod analyze;
pub mod config;
pub mod engines;

pub use analyze::{AnalyzeArgs, cmd_analyze};
pub use config::cmd_config;
pub use engines::cmd_engines;
