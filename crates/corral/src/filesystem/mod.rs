//! Root filesystem swap.

mod pivot;

pub use pivot::pivot_root;
