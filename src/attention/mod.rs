/**
 * Attention Module
 *
 * Turns raw attention and probability tensors from the generator into
 * display data: per-token weights in [0, 1] and ranked token lists.
 * Everything here is pure; inputs are never modified.
 */
mod reduce;
mod tokens;

pub use reduce::*;
pub use tokens::*;
