use std::path::PathBuf;

use thiserror::Error;

use crate::gfx::GfxError;

/// Renderer failure. Every variant is fatal to the viewer.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to create {what}: {source}")]
    ResourceCreation {
        what: &'static str,
        #[source]
        source: GfxError,
    },
    #[error("acceleration structure build failed: {0}")]
    Build(String),
    #[error("cannot import {path:?}: {reason}")]
    Import { path: PathBuf, reason: String },
    #[error("shader library not found: {0:?}")]
    ShaderNotFound(PathBuf),
    #[error("{0} called before {1}")]
    OutOfOrder(&'static str, &'static str),
    #[error("GPU operation failed: {0}")]
    Frame(#[from] GfxError),
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Tag device errors with the step that produced them.
pub(crate) trait GfxResultExt<T> {
    fn creating(self, what: &'static str) -> RenderResult<T>;
    fn building(self) -> RenderResult<T>;
}

impl<T> GfxResultExt<T> for Result<T, GfxError> {
    fn creating(self, what: &'static str) -> RenderResult<T> {
        self.map_err(|source| RenderError::ResourceCreation { what, source })
    }

    fn building(self) -> RenderResult<T> {
        self.map_err(|e| RenderError::Build(e.to_string()))
    }
}
