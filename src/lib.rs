//! mlx-fetch: model repository downloader and cache manager.
//!
//! Downloads large model repositories from a remote hub into the local
//! cache, verifying integrity, repairing partial installs, and exposing
//! the directory layouts downstream model loaders expect.
//!
//! # Architecture
//!
//! The pipeline is built from small components composed by a coordinator:
//! - **Hub client**: metadata listings and streaming downloads over HTTPS
//! - **Integrity verifier**: size and SHA-256 validation with tolerance
//! - **Metadata store**: per-repository manifest cache on disk
//! - **Progress bus**: download/verification event streams
//! - **Failure manager**: per-repository exponential backoff
//! - **Layout**: the `models--owner--repo/snapshots/<rev>` cache shape
//! - **Canonicalizer**: post-download filesystem fixups
//! - **Verification service**: health checks and targeted repair

pub mod backoff;
pub mod canonicalize;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod hub;
pub mod hub_id;
pub mod integrity;
pub mod layout;
pub mod metadata;
pub mod verify;

pub use backoff::NetworkFailureManager;
pub use coordinator::{DiscoveredModel, DownloadCoordinator};
pub use error::{FetchError, Result};
pub use events::{ProgressBus, ProgressUpdate};
pub use hub::HubClient;
pub use integrity::{IntegrityExpectation, ValidationResult};
pub use layout::HubLayout;
pub use metadata::{FileManifestEntry, MetadataStore};
pub use verify::{RepairOutcome, VerificationService};
