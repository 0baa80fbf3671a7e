//! Operation flags carried by every cache call.

use serde::{Deserialize, Serialize};

/// Cross-cutting intent attached to an operation.
///
/// A small bit-set so strategies can branch on intent without inspecting
/// payload types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationFlags(u16);

impl OperationFlags {
    pub const READ_THRU: Self = Self(1 << 0);
    pub const WRITE_THRU: Self = Self(1 << 1);
    pub const WRITE_BEHIND: Self = Self(1 << 2);
    /// Payload is raw bytes supplied by the caller
    pub const BINARY_DATA: Self = Self(1 << 3);
    /// Payload bytes are LZ4 compressed
    pub const COMPRESSED: Self = Self(1 << 4);
    /// Payload is JSON-serialized
    pub const SERIALIZED: Self = Self(1 << 5);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flags that only describe payload encoding.
    #[must_use]
    pub const fn payload_bits(self) -> Self {
        Self(self.0 & (Self::BINARY_DATA.0 | Self::COMPRESSED.0 | Self::SERIALIZED.0))
    }
}

impl std::ops::BitOr for OperationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl std::ops::BitOrAssign for OperationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl std::fmt::Display for OperationFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(OperationFlags, &str); 6] = [
            (OperationFlags::READ_THRU, "read-thru"),
            (OperationFlags::WRITE_THRU, "write-thru"),
            (OperationFlags::WRITE_BEHIND, "write-behind"),
            (OperationFlags::BINARY_DATA, "binary"),
            (OperationFlags::COMPRESSED, "compressed"),
            (OperationFlags::SERIALIZED, "serialized"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let mut flags = OperationFlags::READ_THRU | OperationFlags::COMPRESSED;
        assert!(flags.contains(OperationFlags::READ_THRU));
        assert!(!flags.contains(OperationFlags::WRITE_THRU));

        flags.remove(OperationFlags::COMPRESSED);
        assert_eq!(flags, OperationFlags::READ_THRU);
        assert_eq!(flags.payload_bits(), OperationFlags::empty());
        assert_eq!(flags.to_string(), "read-thru");
        assert_eq!(OperationFlags::empty().to_string(), "none");
    }
}
