//! Concrete collaborators for `talliffy_core`: the backend REST client and the Tally
//! connector process.

#[cfg(feature = "http-backend")]
pub mod backend;
#[cfg(feature = "tally-process")]
pub mod connectors;
