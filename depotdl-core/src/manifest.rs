/*!
The depot manifest data model.

A manifest catalogs one depot: every file path, its size and flags, and the
ordered chunks the file is assembled from. The structures here are the
model the engine schedules from; decoding Valve's protobuf manifest
container into them is left to the front end feeding the engine. The CBOR
serialization of these structures is the on-disk representation the
`depot` subcommand reads.
*/

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flag value marking a mapping as a directory with no data to materialize
pub const FLAG_DIRECTORY: u32 = 64;

/// Error for manifests that cannot be decoded
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("malformed manifest")]
    Encoding(#[from] serde_cbor::Error),
}

type Result<T> = std::result::Result<T, ManifestError>;

/// The catalog of a single depot
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DepotManifest {
    /// Identifier of the depot this manifest describes
    pub depot_id: u32,
    /// Aggregate original size of every file in the depot, in bytes
    pub total_size: u64,
    /// One mapping per file or directory in the depot
    pub mappings: Vec<FileMapping>,
}

impl DepotManifest {
    /// Decodes a manifest from its serialized bytes
    pub fn decode(bytes: &[u8]) -> Result<DepotManifest> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    /// Serializes the manifest to its on-disk representation
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }
}

/// A single file (or directory marker) within a depot
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileMapping {
    /// Path relative to the depot root, possibly with `\` separators
    pub filename: String,
    /// Total original size of the file in bytes
    pub size: u64,
    /// Flags bitfield; only [`FLAG_DIRECTORY`] is interpreted
    pub flags: u32,
    /// Chunks making up the file, addressed by offset
    pub chunks: Vec<ChunkRecord>,
}

impl FileMapping {
    /// The mapping's path with separators normalized to `/`
    pub fn normalized_filename(&self) -> String {
        self.filename.replace('\\', "/")
    }

    pub fn is_directory(&self) -> bool {
        self.flags == FLAG_DIRECTORY
    }
}

/// One downloadable chunk of a file
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// SHA-1 of the chunk contents; doubles as its address on the CDN
    pub sha: [u8; 20],
    /// Absolute byte offset of the chunk within its file
    pub offset: u64,
    /// Original (decompressed) length of the chunk in bytes
    pub cb_original: u32,
}

impl ChunkRecord {
    /// Lower case hex form of the chunk's SHA-1, as used in CDN URLs
    pub fn sha_hex(&self) -> String {
        hex::encode(self.sha)
    }
}
