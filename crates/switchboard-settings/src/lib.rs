//! Configuration for the session manager, resolved once at startup and
//! passed to constructors by value.
//!
//! Later layers win: compiled defaults ([`SwitchboardSettings::default()`]),
//! then `~/.switchboard/settings.json` merged over them, then `SWITCHBOARD_*`
//! environment variables.
//!
//! ```no_run
//! let settings = switchboard_settings::load_settings().unwrap_or_default();
//! println!("database: {}", settings.database.path);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, merge_into, settings_path};
pub use types::*;
