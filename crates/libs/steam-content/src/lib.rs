//! # steam-content
//!
//! HTTP side of depot downloads: a pool of authenticated content-server
//! connections, depot manifest decoding and deduplicated chunk fetching.
//!
//! ## Request Flow
//!
//! ```text
//! POST /initsession/          sessionkey, appticket    (once per server)
//! POST /authdepot/            appticket + x-steam-auth (once per depot per connection)
//! GET  /depot/{id}/manifest/{gid}/5
//! GET  /depot/{id}/chunk/{SHA1 HEX}
//! ```
//!
//! Every signed request carries
//! `x-steam-auth: sessionid={id};req-counter={n};hash={SHA1 HEX};` where the
//! counter is advanced before signing.
//!
//! ```rust
//! use steam_content::auth_header;
//!
//! let header = auth_header(1, 1, &[0u8; 32], "/depot/7/manifest/1/5");
//! assert!(header.starts_with("sessionid=1;req-counter=1;hash="));
//! ```

pub mod auth;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod manifest;
pub mod pool;
pub mod proto;
pub mod server_list;
pub mod vdf;

pub use auth::{auth_header, ContentServerConnection};
pub use config::ContentConfig;
pub use download::{
    download_depot, ChunkLocation, ChunkPlan, ChunkSink, DepotJob, DirectorySink, DownloadStats,
    PlannedChunk,
};
pub use error::{ContentError, ManifestError, VdfError};
pub use http::{HttpClient, HttpRequest, HttpResponse, Method, ReqwestClient};
pub use manifest::{
    ChunkId, ChunkRecord, DepotFileFlags, DepotKey, FileRecord, Manifest, ManifestMetadata,
};
pub use pool::ContentPool;
pub use server_list::fetch_server_list;
