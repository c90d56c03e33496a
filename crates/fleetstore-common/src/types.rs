//! Core type definitions for Fleetstore
//!
//! Identifiers and the placement data model: storage nodes, tiers,
//! chunks, fragments and blocks.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use uuid::{NoContext, Timestamp, Uuid};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
            Display,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Get as bytes
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    Error::invalid_argument(format!(concat!("invalid ", stringify!($name), ": {}"), e))
                })
            }
        }
    };
}

uuid_id!(
    /// Identifier of a system (tenant namespace owning tiers, nodes and data)
    SystemId
);
uuid_id!(
    /// Identifier of a storage node
    NodeId
);
uuid_id!(
    /// Identifier of a placement tier
    TierId
);
uuid_id!(
    /// Identifier of a chunk
    ChunkId
);

/// Identifier of a block.
///
/// Block ids are time-ordered (UUID v7) so the creation time of a
/// provisional block can be recovered from its id alone.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Generate a new block id stamped with the current time
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Generate a block id stamped with the given unix time in milliseconds
    #[must_use]
    pub fn at_unix_ms(ms: u64) -> Self {
        let ts = Timestamp::from_unix(NoContext, ms / 1000, ((ms % 1000) * 1_000_000) as u32);
        Self(Uuid::new_v7(ts))
    }

    /// Create from an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Creation time in unix milliseconds, if the id carries one
    #[must_use]
    pub fn created_at_ms(&self) -> Option<u64> {
        self.0.get_timestamp().map(|ts| {
            let (secs, nanos) = ts.to_unix();
            secs * 1000 + u64::from(nanos) / 1_000_000
        })
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::invalid_argument(format!("invalid BlockId: {e}")))
    }
}

/// Health of a storage node as seen by the control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    /// Reachable and serving
    #[display("ONLINE")]
    Online,
    /// Reachable but recently failing requests or reconnecting
    #[display("HAS_ISSUES")]
    HasIssues,
    /// Not eligible for placement; its blocks need repair
    #[display("OFFLINE")]
    Offline,
}

impl NodeHealth {
    /// Whether the node may receive new blocks
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

/// A storage agent process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub system: SystemId,
    /// Human-readable name
    pub name: String,
    /// Address used for direct connections (`host:port`)
    pub address: String,
    /// Tier this node serves
    pub tier: TierId,
    /// Set once the node is permanently removed
    #[serde(default)]
    pub decommissioned: bool,
}

impl Node {
    /// Create a new active node
    #[must_use]
    pub fn new(system: SystemId, tier: TierId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            system,
            name: name.into(),
            address: address.into(),
            tier,
            decommissioned: false,
        }
    }
}

/// A placement policy class
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: TierId,
    pub system: SystemId,
    pub name: String,
    /// Minimum number of distinct nodes hosting any chunk of this tier
    pub min_nodes: u32,
    /// Target number of blocks per fragment
    pub replicas: u32,
}

impl Tier {
    /// Lowest allowed value for `min_nodes`
    pub const MIN_DISTINCT_NODES: u32 = 3;

    /// Create a tier, validating its policy
    pub fn new(system: SystemId, name: impl Into<String>, min_nodes: u32, replicas: u32) -> Result<Self> {
        let tier = Self {
            id: TierId::new(),
            system,
            name: name.into(),
            min_nodes,
            replicas,
        };
        tier.validate()?;
        Ok(tier)
    }

    /// Check the policy invariants
    pub fn validate(&self) -> Result<()> {
        if self.min_nodes < Self::MIN_DISTINCT_NODES {
            return Err(Error::InvalidTier(format!(
                "tier {} requires at least {} distinct nodes, got {}",
                self.name,
                Self::MIN_DISTINCT_NODES,
                self.min_nodes
            )));
        }
        if self.replicas == 0 {
            return Err(Error::InvalidTier(format!(
                "tier {} must keep at least one replica",
                self.name
            )));
        }
        Ok(())
    }
}

/// Logical unit of object data, split into `total_frags` fragments of which
/// `data_frags` are needed to reconstruct it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub system: SystemId,
    pub tier: TierId,
    /// Total size of the chunk data in bytes
    pub size: u64,
    /// Hex SHA-256 over all fragments in index order
    pub digest: String,
    /// Fragments required for reconstruction (k)
    pub data_frags: u32,
    /// Fragments produced for the chunk (n)
    pub total_frags: u32,
    /// Size of every fragment (and therefore of every block)
    pub frag_size: u64,
}

impl Chunk {
    /// Describe a chunk from its already-split fragments.
    ///
    /// All fragments must have the same length.
    pub fn from_fragments<T: AsRef<[u8]>>(
        system: SystemId,
        tier: TierId,
        size: u64,
        data_frags: u32,
        fragments: &[T],
    ) -> Result<Self> {
        let total_frags = u32::try_from(fragments.len())
            .map_err(|_| Error::invalid_argument("too many fragments"))?;
        if total_frags == 0 {
            return Err(Error::invalid_argument("chunk needs at least one fragment"));
        }
        if data_frags == 0 || data_frags > total_frags {
            return Err(Error::invalid_argument(format!(
                "data fragments must be in 1..={total_frags}, got {data_frags}"
            )));
        }
        let frag_size = fragments[0].as_ref().len();
        if fragments.iter().any(|f| f.as_ref().len() != frag_size) {
            return Err(Error::invalid_argument("fragments must have equal sizes"));
        }
        Ok(Self {
            id: ChunkId::new(),
            system,
            tier,
            size,
            digest: digest_fragments(fragments),
            data_frags,
            total_frags,
            frag_size: frag_size as u64,
        })
    }

    /// Valid fragment indices, `0..n`
    #[must_use]
    pub const fn fragment_indices(&self) -> Range<u32> {
        0..self.total_frags
    }

    /// Check that `index` names a fragment of this chunk
    pub fn validate_fragment(&self, index: u32) -> Result<()> {
        if index < self.total_frags {
            Ok(())
        } else {
            Err(Error::InvalidFragment {
                index,
                total: self.total_frags,
            })
        }
    }
}

/// Hex SHA-256 over fragments concatenated in index order
#[must_use]
pub fn digest_fragments<T: AsRef<[u8]>>(fragments: &[T]) -> String {
    let mut hasher = Sha256::new();
    for fragment in fragments {
        hasher.update(fragment.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// Natural key of a block: one block per (chunk, fragment, node)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    pub chunk: ChunkId,
    pub fragment: u32,
    pub node: NodeId,
}

/// A physical, on-node instance of a fragment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub system: SystemId,
    pub tier: TierId,
    pub node: NodeId,
    pub chunk: ChunkId,
    pub fragment: u32,
    pub size: u64,
    /// Provisional, not-yet-durable block
    pub upload_mode: bool,
}

impl Block {
    /// A new provisional block for `fragment` of `chunk` on `node`
    #[must_use]
    pub fn pending(chunk: &Chunk, fragment: u32, node: NodeId) -> Self {
        Self {
            id: BlockId::new(),
            system: chunk.system,
            tier: chunk.tier,
            node,
            chunk: chunk.id,
            fragment,
            size: chunk.frag_size,
            upload_mode: true,
        }
    }

    #[must_use]
    pub const fn key(&self) -> BlockKey {
        BlockKey {
            chunk: self.chunk,
            fragment: self.fragment,
            node: self.node,
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.upload_mode
    }
}

/// Role carried by an authenticated principal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[display("admin")]
    Admin,
    #[display("operator")]
    Operator,
    #[display("user")]
    User,
}
