// =============================================================================
// HTTP API — thin axum handlers over component operations
// =============================================================================

pub mod rest;
