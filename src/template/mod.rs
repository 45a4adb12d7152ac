//! Template documents and their validation.
//!
//! A template describes one or more virtual environments offered to
//! participants. The raw [`TemplateDocument`] mirrors the JSON shape exactly
//! and round-trips without loss; [`validate`] turns it into a
//! [`ValidTemplate`] whose [`EnvironmentSpec`]s are what the rest of the
//! crate works with.
//!
//! - [`document`]: lossless JSON model
//! - [`model`]: validated, strongly-typed model
//! - [`validator`]: structural, referential and policy checks
//! - [`catalog`]: registry of named templates with online/offline status
//! - [`url`]: `{0}`/`{1}` display URL templates

pub mod catalog;
pub mod document;
pub mod model;
pub mod url;
pub mod validator;

pub use catalog::{CatalogEntry, CatalogError, TemplateCatalog, TemplateStatus};
pub use document::{CommandLine, TemplateDocument, VirtualEnvironmentDocument};
pub use model::{
    Credentials, EnvironmentSpec, LaunchSpec, NetworkMode, PortSpec, Protocol, Provider,
    RemoteProtocol, RemoteSpec, ResourceLimits, Secret, SecurityProfile, ValidTemplate,
};
pub use url::UrlTemplate;
pub use validator::{TemplateValidator, ValidationOptions, validate};

/// Reference template: an Ubuntu terminal with a public website port and an
/// SSH port brokered through Guacamole.
pub const SAMPLE_TEMPLATE: &str = include_str!("../../templates/sample-template-for-docker.json");
