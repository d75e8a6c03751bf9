pub mod access;
pub mod config;
pub mod error;
pub mod manifest;
pub mod time;

pub use access::{Access, BlockAccess, DirtyBlockAccess, EntityId, VlobAccess};
pub use error::{FsError, FsResult};
pub use manifest::{
    Children, LocalFileManifest, LocalFolderManifest, LocalManifest, LocalUserManifest,
    RemoteFileManifest, RemoteFolderManifest, RemoteManifest, RemoteUserManifest,
};
pub use time::{now_ts, Timestamp};
