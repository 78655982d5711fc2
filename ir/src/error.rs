use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised when a schedule primitive cannot be applied to a state.
///
/// All of these indicate a corrupted state or a bug in the caller: the
/// search rules are expected to only ever construct applicable steps.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("stage id {stage_id} out of bounds: state has {count} stages"))]
    StageOutOfBounds { stage_id: usize, count: usize },

    #[snafu(display("iterator id {iter_id} out of bounds: stage {stage_id} has {count} iterators"))]
    IterOutOfBounds { stage_id: usize, iter_id: usize, count: usize },

    #[snafu(display("cannot fuse non-contiguous iterators {iter_ids:?} of stage {stage_id}"))]
    FuseNonContiguous { stage_id: usize, iter_ids: Vec<usize> },

    #[snafu(display("fuse requires at least one iterator (stage {stage_id})"))]
    FuseEmpty { stage_id: usize },

    #[snafu(display("reorder of stage {stage_id} must be a permutation of {expected} iterators, got {found}"))]
    ReorderMismatch { stage_id: usize, expected: usize, found: usize },

    #[snafu(display("split of stage {stage_id} requires at least one length"))]
    SplitEmpty { stage_id: usize },

    #[snafu(display("cannot inline stage {stage_id}: it carries a reduction iterator"))]
    InlineReduction { stage_id: usize },

    #[snafu(display("cannot apply {primitive} to placeholder stage {stage_id}"))]
    PrimitiveOnPlaceholder { primitive: &'static str, stage_id: usize },

    #[snafu(display("rfactor of stage {stage_id} expects a reduction iterator, got a spatial one"))]
    RfactorOnSpatial { stage_id: usize },

    #[snafu(display("rfactor factor axis {factor_axis} out of bounds for stage {stage_id}"))]
    RfactorFactorAxis { stage_id: usize, factor_axis: usize },

    #[snafu(display("compute_at target stage {target_stage_id} equals the attached stage"))]
    SelfAttachment { target_stage_id: usize },

    #[snafu(display("operation {op} not found in the compute DAG"))]
    UnknownOperation { op: usize },
}
