//! Continuous package-building service for language toolchains.
//!
//! The factory drives container-isolated builds for `(package, version)`
//! pairs described by an on-disk recipe tree, folds the resulting `.deb`
//! artifacts into an apt repository served over HTTP, keeps a registry of
//! what has been built, and derives per-language execution profiles from
//! that registry. Builds are triggered manually, by a daily schedule, or
//! by HMAC-verified webhooks.

/// Service wiring, the build queue and orchestration.
pub mod app;
/// Debian repository maintenance via reprepro.
pub mod apt;
/// Container-isolated builds.
pub mod builder;
/// Service configuration file.
pub mod config;
/// Signed update notifications.
pub mod notify;
/// JSON state files.
pub mod persist;
/// Placeholder expansion in template strings.
pub mod placeholder;
/// Profile synthesis.
pub mod profiles;
/// The recipe graph and its sources.
pub mod recipes;
/// Registry of built artifacts.
pub mod registry;
/// HMAC signatures on the external surfaces.
pub mod signature;
/// The embedded relational store.
pub mod store;
/// The running-task ledger.
pub mod tasks;
/// The HTTP surface.
pub mod web;

pub use app::{FactoryConfig, FactoryContext, QueueTask, StartupError};
pub use builder::{BuildResult, Builder, BuilderConfig};
pub use profiles::Profile;
pub use recipes::{BuildConfig, PackageRecipe, RecipeTree};
pub use registry::{AvailablePackage, AvailablePackages};
