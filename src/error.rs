use std::fmt;

/// The error kinds the runtime distinguishes when deciding whether to
/// continue the decision loop. Only `Fatal` ever stops a strategy outright.
#[derive(Debug)]
pub enum RuntimeError {
    /// Invalid user request or missing credentials for live mode. Fails
    /// fast at runtime construction, before any strategy task is spawned.
    Configuration(String),
    /// Market data, snapshot, or LLM call failed. Treated as empty data;
    /// the cycle continues with a rationale note.
    UpstreamUnavailable(String),
    /// Planner output did not conform to `PlanProposal`. Treated as an
    /// empty plan with a rationale echoing the raw response.
    Validation(String),
    /// Exchange returned an error or the submission call failed at the
    /// network layer. Surfaces as `TxResult { status: Error, .. }`, never
    /// propagated as a Rust error past the execution gateway.
    Gateway(String),
    /// Logged and otherwise swallowed; never propagated into the decision
    /// loop.
    Persistence(String),
    /// An uncaught programming error. Only this variant ends a strategy's
    /// task; the Stream Controller records it as `STOPPED, reason=error`.
    Fatal(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Configuration(m) => write!(f, "configuration error: {m}"),
            RuntimeError::UpstreamUnavailable(m) => write!(f, "upstream unavailable: {m}"),
            RuntimeError::Validation(m) => write!(f, "validation error: {m}"),
            RuntimeError::Gateway(m) => write!(f, "gateway error: {m}"),
            RuntimeError::Persistence(m) => write!(f, "persistence error: {m}"),
            RuntimeError::Fatal(m) => write!(f, "fatal: {m}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

pub type Result<T> = std::result::Result<T, RuntimeError>;
