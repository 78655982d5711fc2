use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A missing or malformed search parameter. Fatal: surfaced to the caller
    /// before any search work starts.
    #[snafu(display("configuration error for parameter `{key}`: {reason}"))]
    Configuration { key: String, reason: String },

    /// A schedule primitive could not be applied. Indicates a bug in a rule
    /// or facade, never recovered from.
    #[snafu(display("schedule state manipulation failed"))]
    State { source: loft_ir::Error },

    /// The sketch postprocess found an rfactor step without its split.
    #[snafu(display("expected a split step immediately before the rfactor at step {index}"))]
    RfactorWithoutSplit { index: usize },

    /// Sketch generation produced nothing to search over.
    #[snafu(display("the search space contains no candidate states"))]
    EmptySearchSpace,

    /// The measurer never reported a best state for the workload.
    #[snafu(display("no measurement recorded for workload `{workload_key}`"))]
    NoBestState { workload_key: String },
}
