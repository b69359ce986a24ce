use std::{error::Error, fmt};

use crate::entry::ClassId;

/// Ways a pool allocation can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Bigger than the largest size class, and no registered bucket fits
    InvalidSize { size: usize },
    /// The backing allocator returned nothing
    OutOfMemory { size: usize },
    /// A bucket was asked for more than its block size
    ///
    /// The pool never routes a request like this by itself,
    /// so seeing it means the caller picked the wrong bucket.
    SizeExceedsClass { size: usize, block_size: usize },
    /// No bucket was ever registered under this id
    UnknownClass { class: ClassId },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidSize { size } => {
                write!(f, "no size class can hold {size} bytes")
            }
            PoolError::OutOfMemory { size } => {
                write!(f, "backing allocator failed to provide {size} bytes")
            }
            PoolError::SizeExceedsClass { size, block_size } => write!(
                f,
                "request of {size} bytes exceeds bucket block size {block_size}"
            ),
            PoolError::UnknownClass { class } => write!(f, "no bucket for {class:?}"),
        }
    }
}

impl Error for PoolError {}
