//! Errors reported by the cost analysis and the graph it walks.

/// Errors that can occur while analyzing or querying the cost of a computation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CostError {
    /// A byte-based query was made but no shape-size function was configured.
    #[error("no shape size function was configured, so byte counts are unavailable")]
    MissingShapeSize,

    /// A shape without a memory layout was sized while layouts are required, or a per-instruction
    /// byte query hit an instruction whose byte count was computed without one.
    #[error("shape of `{instruction}` has no layout, so its byte count is unavailable")]
    MissingLayout { instruction: String },

    /// The instruction carries metadata the analysis cannot interpret.
    #[error("cannot analyze `{instruction}`: {reason}")]
    Malformed { instruction: String, reason: String },

    #[error("`{0}` has no committed cost record")]
    NotAnalyzed(String),

    #[error("`{0}` is costed as part of a called computation; revisit its caller instead")]
    NestedInstruction(String),

    #[error("`{0}` already has a committed cost record")]
    AlreadyAnalyzed(String),

    #[error("computation `{0}` calls itself")]
    RecursiveComputation(String),

    #[error("computation `{0}` contains a cycle")]
    Cycle(String),

    #[error("no instruction with identity {0}")]
    UnknownInstruction(String),

    #[error("no computation with identity {0}")]
    UnknownComputation(usize),
}

impl CostError {
    pub fn malformed(instruction: &str, reason: impl Into<String>) -> Self {
        CostError::Malformed {
            instruction: instruction.to_owned(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = CostError> = std::result::Result<T, E>;
