//! Module capability traits.
//!
//! A module is one of three variants. Inputs produce records on a cron
//! schedule, transforms mutate metrics within a frame, outputs emit a
//! frame to an external sink without touching it. All three share the
//! [`Lifecycle`] hooks, which default to no-ops.

pub mod builtin;

use async_trait::async_trait;
use streamlet_types::error::TransformError;
use streamlet_types::{MetricFrame, Record, Records};

/// Connect/flush/close hooks shared by every module variant.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Called once at startup, after chain compilation. A failure here
    /// aborts startup.
    async fn on_connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called first during shutdown; modules typically flush buffers
    /// here and may still perform IO.
    async fn on_pre_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called last, in reverse registration order; must close resources.
    async fn on_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Record-producing module. One input owns any number of tasks.
#[async_trait]
pub trait Input: Lifecycle {
    /// Run one fire with the owning task's parameters.
    async fn fetch(&self, params: &Record) -> anyhow::Result<Records>;
}

/// Frame-mutating module.
#[async_trait]
pub trait Transform: Lifecycle {
    /// Mutate metrics in place. The frame's length is fixed; a
    /// [`TransformError::Terminal`] aborts the chain and skips outputs.
    async fn apply(&self, frame: &mut MetricFrame) -> Result<(), TransformError>;
}

/// Frame-emitting module; receives the frame read-only.
#[async_trait]
pub trait Output: Lifecycle {
    async fn emit(&self, frame: &MetricFrame) -> anyhow::Result<()>;
}
