/*!
The depotdl download engine.

Given a decoded depot manifest and the depot's key, [`engine::DepotEngine`]
reconstructs the depot's file tree: every outstanding chunk is fetched from
a rotating pool of content servers, decrypted, decompressed, CRC checked,
and written at its offset, with completed chunks recorded in an on-disk
ledger so an interrupted run picks up where it left off.

The Steam side (server directory, CDN auth tokens) sits behind the
[`session::SteamSession`] trait, so the engine can be driven by the real
web API, a full CM login client, or a test double.
*/

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod layout;
pub mod ledger;
pub mod pool;
pub mod session;

pub use engine::{DepotEngine, EngineConfig, EngineError};
