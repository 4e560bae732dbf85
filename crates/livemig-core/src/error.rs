use crate::Gpa;

/// An error that can occur during live migration.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A multifd channel received or produced a malformed packet.
    #[error("multifd channel {channel}: {reason}")]
    ChannelProtocol {
        /// The channel that detected the violation.
        channel: u8,

        /// What was wrong with the packet.
        reason: String,
    },

    /// A compression backend failed to encode or decode a packet.
    #[error("multifd channel {channel}: {codec} backend failed: {source}")]
    CompressionBackend {
        /// The channel the backend belongs to.
        channel: u8,

        /// The name of the backend.
        codec: &'static str,

        /// The backend-specific error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The in-guest helper did not complete a command in time.
    #[error("confidential helper timed out on {command} (gpa {gpa})")]
    ConfidentialHelperTimeout {
        /// The command that timed out.
        command: &'static str,

        /// The guest physical address of the command.
        gpa: Gpa,
    },

    /// The in-guest helper completed a command with a nonzero status.
    #[error("confidential helper rejected {command} (gpa {gpa}, ret {ret})")]
    ConfidentialHelperNack {
        /// The rejected command.
        command: &'static str,

        /// The guest physical address of the command.
        gpa: Gpa,

        /// The status reported by the helper.
        ret: u32,
    },

    /// The RAM block is not known.
    #[error("unknown RAM block `{0}`")]
    UnknownRamBlock(String),

    /// A RAM block with the same id is already registered.
    #[error("duplicate RAM block `{0}`")]
    DuplicateRamBlock(String),

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// A parameter is outside of its valid range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// The parameter name.
        name: &'static str,

        /// Why the value was rejected.
        reason: String,
    },

    /// Another measurement is already in progress.
    #[error("A measurement is already in progress")]
    Busy,

    /// The migration was aborted by an earlier error.
    #[error("migration aborted: {0}")]
    Aborted(String),

    /// The operation was cancelled.
    #[error("Operation cancelled.")]
    Cancelled,

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Timeout.
    #[error("Operation timed out.")]
    Timeout,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl MigrationError {
    /// Creates a new channel protocol error.
    pub fn protocol(channel: u8, reason: impl Into<String>) -> Self {
        Self::ChannelProtocol {
            channel,
            reason: reason.into(),
        }
    }

    /// Creates a new invalid parameter error.
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error aborts the whole migration attempt.
    ///
    /// Errors of the optimization layers (sampling, throttling) and
    /// parameter validation errors are not fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ChannelProtocol { .. }
                | Self::CompressionBackend { .. }
                | Self::ConfidentialHelperTimeout { .. }
                | Self::ConfidentialHelperNack { .. }
                | Self::UnknownRamBlock(_)
                | Self::OutOfBounds
                | Self::Aborted(_)
        )
    }
}
