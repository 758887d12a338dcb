//! homestore-core: storage core for a home media server.
//!
//! Discovers removable drives, decides where and how to mount them, keeps
//! fstab in sync, and classifies drive health from SMART data. Every
//! external effect goes through a [`executor::CommandRunner`].
//!
//! # Modules
//!
//! - [`executor`]: Command execution with timeouts and privilege escalation
//! - [`disk`]: Removable device discovery using `lsblk` and `blkid`
//! - [`probe`]: System-disk heuristic with scoped scratch mounts
//! - [`preset`]: Mount option policy per filesystem
//! - [`fstab`]: Fstab parsing, backup and persistence
//! - [`mount`]: Smart mount, unmount and disk usage
//! - [`setup`]: Bulk auto-setup and media links
//! - [`health`]: SMART health classification
//! - [`session`]: Locks and mount point reservations
//! - [`config`]: Runtime configuration
//! - [`api`]: Serializable responses for front ends
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use homestore_core::api::Storage;
//! use homestore_core::config::StorageConfig;
//! use homestore_core::mount::MountRequest;
//!
//! let storage = Storage::from_config(StorageConfig::default());
//!
//! for device in storage.list_devices().devices {
//!     if !device.is_mounted && !device.is_system {
//!         let response = storage.smart_mount(&MountRequest::new(&device.device_path));
//!         println!("{:?}", response.mount_point);
//!     }
//! }
//! ```

pub mod api;
pub mod config;
pub mod disk;
pub mod error;
pub mod executor;
pub mod fstab;
pub mod health;
pub mod mount;
pub mod preset;
pub mod probe;
pub mod session;
pub mod setup;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use api::Storage;
pub use config::StorageConfig;
pub use disk::BlockDevice;
pub use error::{Error, Result};
pub use executor::{CommandRunner, ExecutionContext};
pub use fstab::{FstabEntry, PersistMode};
pub use health::{HealthRecord, HealthStatus};
pub use mount::MountRequest;
pub use preset::MountOptions;
pub use session::StorageSession;
