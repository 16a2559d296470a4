// =============================================================================
// Upstream provider integration — auth, wire decoding, streaming client
// =============================================================================

pub mod auth;
pub mod frame;
pub mod stream;
