//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + CLI overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, anchor spec parsing)
//!     → DaemonConfig (validated, immutable)
//!     → shared via Arc to all connection tasks
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; hot reload is out of scope
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    parse_size, AnchorConfig, CertEntry, CraftPolicy, DaemonConfig, ListenerConfig, TimeoutConfig,
    TlsSettings,
};
pub use validation::validate_config;
