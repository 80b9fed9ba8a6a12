#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod config;
mod core;
mod engine;
mod error;
mod io;
mod provider;
mod session;
mod snapshot;
mod store;
mod work;

pub use crate::blueprint::{Blueprint, Project, WorkDef, WorkHandle};
pub use crate::config::{Settings, SymlinkPolicy};
pub use crate::core::{CancellationToken, Hash32};
pub use crate::engine::{BuildReport, ExecutionReason, Executor, Outcome, WorkOutcome, WorkState};
pub use crate::error::*;
pub use crate::io::as_overhead;
pub use crate::provider::{
    Composite, ExecutionTimeValue, Provider, SideEffect, SideEffects, Supplier, Value,
    ValueConsumer, ValueProducer,
};
pub use crate::session::{BuildSession, SessionState};
pub use crate::snapshot::{
    DirectorySnapshot, FileSnapshot, LocatedSnapshot, Snapshot, SymlinkSnapshot, Snapshotter,
};
pub use crate::store::{
    ExecutionRecord, FileFingerprint, HistoryStore, InputFingerprint, OutputFilesRepository,
    Ownership, Store, StoreLock,
};
pub use crate::work::{
    FileInput, InputSource, OutputKind, ValueInput, WorkContext, WorkItem, WorkResult,
};

/// Installs a `tracing` subscriber printing log lines above the progress bars.
///
/// The filter is read from `RUST_LOG` and defaults to `kiln=info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "kiln=info".into()))
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}
