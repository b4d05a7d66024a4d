mod client;
mod remote;

pub use client::{DriveClient, DriveError, ErrorClass};
pub use remote::{
    ACCOUNT_ROOT_ID, ChangeSet, FOLDER_MIME_TYPE, RemoteChange, RemoteItem, RemoteKind, RemoteStore,
    UploadedFile,
};
pub use reqwest::StatusCode;
