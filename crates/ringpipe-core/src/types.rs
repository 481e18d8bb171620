//! Dense identifiers for pipeline objects.
//!
//! Ids are assigned by whoever builds the graph and double as indices into
//! the graph's descriptor tables and into per-segment fire-count arrays.

use serde::{Deserialize, Serialize};

macro_rules! dense_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Create a new id.
            pub const fn new(id: u32) -> Self {
                $name(id)
            }

            /// Get the inner value.
            pub const fn get(&self) -> u32 {
                self.0
            }

            /// Get the id as a table index.
            #[inline]
            pub const fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                $name(id)
            }
        }

        impl From<usize> for $name {
            fn from(id: usize) -> Self {
                $name(id as u32)
            }
        }

        impl From<$name> for usize {
            fn from(id: $name) -> Self {
                id.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

dense_id!(
    /// Kernel identifier.
    KernelId,
    "k"
);

dense_id!(
    /// Edge identifier.
    EdgeId,
    "e"
);

dense_id!(
    /// Segment identifier.
    SegmentId,
    "s"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(KernelId::new(4).to_string(), "k4");
        assert_eq!(EdgeId::new(0).to_string(), "e0");
        assert_eq!(SegmentId::new(12).to_string(), "s12");
    }

    #[test]
    fn test_id_conversions() {
        let id = KernelId::from(7usize);
        assert_eq!(id.get(), 7);
        assert_eq!(id.index(), 7);
        assert_eq!(usize::from(id), 7);
        assert!(KernelId::new(1) < KernelId::new(2));
    }
}
