// =============================================================================
// Market data — funding rates in, unified snapshots and spreads out
// =============================================================================

pub mod aggregator;
pub mod funding;
pub mod secondary;
