pub mod aggregate;
pub mod api;
pub mod config;
pub mod constants;
pub mod io;
pub mod posting;
pub mod rdf;
pub mod reader;
pub mod reduce;
pub mod runtime;
pub mod schema;
pub mod shuffle;
pub mod sort;
pub mod source;
pub mod state;
pub mod stats;
pub mod sync;
pub mod uid;
pub mod utils;
pub mod writer;

pub use aggregate::PostingListWriter;
pub use api::{Aggregator, Merger, Posting, RecordTransformer, SpillReader, SpillWriter};
pub use config::{LoaderOptions, QueueCapacities};
pub use posting::{FlatPosting, PostingValue};
pub use rdf::RdfTransformer;
pub use runtime::{Loader, Phase, SpillStages};
pub use schema::SchemaStore;
pub use state::SharedState;
pub use stats::Progress;
