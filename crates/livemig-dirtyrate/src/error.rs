use livemig_core::MigrationError;

/// A problem that drops one block from a sampling round.
///
/// Sampling is best effort, so these are logged and never returned to the
/// caller of a measurement.
#[derive(thiserror::Error, Debug)]
pub enum SamplingError {
    /// The block was resized between baseline and comparison.
    #[error("RAM block `{0}` changed geometry during the measurement")]
    GeometryChanged(String),

    /// The block was unregistered between baseline and comparison.
    #[error("RAM block `{0}` was removed during the measurement")]
    BlockRemoved(String),

    /// A sampled page could not be read.
    #[error("failed to read RAM block `{block}`: {source}")]
    Read {
        /// The block id.
        block: String,

        /// The underlying error.
        #[source]
        source: MigrationError,
    },
}
