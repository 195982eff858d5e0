use crate::config::LoaderOptions;
use crate::schema::SchemaStore;
use crate::stats::Progress;
use crate::uid::UidMap;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Everything the stages of one load share: options plus the uid allocator,
/// schema store and progress counters. Owned by the loader; nothing here is
/// process-global.
pub struct SharedState {
    pub opts: LoaderOptions,
    pub progress: Arc<Progress>,
    pub uids: Arc<UidMap>,
    pub schema: Arc<SchemaStore>,
}

impl SharedState {
    /// Validate the options and read the initial schema from `opts.schema_file`.
    pub fn new(opts: LoaderOptions) -> Result<Self> {
        opts.validate()?;
        let text = std::fs::read_to_string(&opts.schema_file)
            .with_context(|| format!("Could not load schema from {}", opts.schema_file.display()))?;
        let schema = SchemaStore::parse(&text).context("Could not parse schema")?;
        Self::with_schema(opts, schema)
    }

    pub fn with_schema(opts: LoaderOptions, schema: SchemaStore) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            progress: Arc::new(Progress::new()),
            uids: Arc::new(UidMap::new()),
            schema: Arc::new(schema),
        })
    }
}
