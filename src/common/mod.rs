// # Common Types
//
// Shared identifiers and addresses used across the execution engine.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Index of a transaction slot on this server
pub type TranIndex = usize;

/// Globally visible transaction identifier
pub type TransactionId = u64;

/// Identifier of a query execution, owner of its temporary list files
pub type QueryId = u64;

/// Cluster node identifier as carried on the wire
pub type NodeId = u32;

/// Network request identifier (16-bit, never zero)
pub type RequestId = u16;

/// A class's physical schema version; bumped on DDL
pub type ReprId = u32;

/// The local node id
pub const LOCAL_NODE_ID: NodeId = 0;

// ============================================================================
// Physical Addresses
// ============================================================================

/// Object identifier: (volume, page, slot)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Oid {
    pub volid: u16,
    pub pageid: u32,
    pub slotid: u16,
}

impl Oid {
    pub const NULL: Oid = Oid {
        volid: u16::MAX,
        pageid: u32::MAX,
        slotid: u16::MAX,
    };

    pub fn new(volid: u16, pageid: u32, slotid: u16) -> Self {
        Self { volid, pageid, slotid }
    }

    pub fn is_null(&self) -> bool {
        *self == Oid::NULL
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.volid, self.pageid, self.slotid)
    }
}

/// Volume-page identifier for temporary pages
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Vpid {
    pub volid: u16,
    pub pageid: u32,
}

impl Vpid {
    pub const NULL: Vpid = Vpid {
        volid: u16::MAX,
        pageid: u32::MAX,
    };

    pub fn new(volid: u16, pageid: u32) -> Self {
        Self { volid, pageid }
    }
}

/// Address of a tuple within a list file: (page, offset on page)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TupleAddress {
    pub vpid: Vpid,
    pub offset: u32,
}

impl TupleAddress {
    pub const NULL: TupleAddress = TupleAddress {
        vpid: Vpid::NULL,
        offset: u32::MAX,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_oid() {
        assert!(Oid::NULL.is_null());
        assert!(!Oid::new(0, 1, 2).is_null());
    }

    #[test]
    fn test_oid_display() {
        assert_eq!(Oid::new(0, 42, 7).to_string(), "0|42|7");
    }
}
