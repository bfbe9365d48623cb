// src/error.rs
//! Error handling for the whole crate.
//!
//! - **Init**: anything that stops the renderer from starting (missing GPU
//!   feature, shader load/compile, allocation, pipeline creation).
//! - **Upload**: transfer buffer writes and one-shot copy submissions.
//! - **Frame**: failures inside the per-frame command buffer lifecycle.
//!
//! Context chaining lives in [`crate::context`].

use std::fmt;
use thiserror::Error;

/// Failures of the per-frame command buffer lifecycle.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FrameError {
    /// No command buffer could be acquired this frame.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Swapchain acquisition failed hard (an unavailable swapchain is not an error).
    #[error("swapchain acquisition failed: {0}")]
    Swapchain(String),

    /// A command was recorded against a pass or command buffer that is not
    /// open, or out of order.
    #[error("recording failed: {0}")]
    Recording(String),

    /// Submitting the command buffer failed.
    #[error("submit failed: {0}")]
    Submit(String),

    /// A frame operation was issued out of order.
    #[error("invalid frame transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Main error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Startup failure (device features, shaders, allocations, pipelines).
    #[error("init error: {0}")]
    Init(String),

    /// Transfer buffer mapping or copy submission failure.
    #[error("upload error: {0}")]
    Upload(String),

    /// Per-frame failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O errors (shader blobs, config files, images).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding failures.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// GLTF import failures.
    #[error("gltf error: {0}")]
    Gltf(#[from] gltf::Error),

    /// Configuration file parse failures.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Rich context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[inline]
    pub fn init<S: Into<String>>(msg: S) -> Self {
        Self::Init(msg.into())
    }

    #[inline]
    pub fn upload<S: Into<String>>(msg: S) -> Self {
        Self::Upload(msg.into())
    }

    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    /// Add context to any error (chainable, like `.context()` in anyhow).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        matches!(self.root(), Error::Init(_))
    }

    #[inline]
    pub fn is_upload(&self) -> bool {
        matches!(self.root(), Error::Upload(_))
    }

    #[inline]
    pub fn is_frame(&self) -> bool {
        matches!(self.root(), Error::Frame(_))
    }
}

/// Convenient `Result` alias; use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;
