//! Service Layer
//!
//! Business logic behind the HTTP handlers. Services own the pipeline and
//! its collaborators; handlers only parse requests and shape responses.

mod analysis_service;

pub use analysis_service::*;
