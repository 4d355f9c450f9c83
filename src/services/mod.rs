pub mod local_backend;
pub mod storage_backend;
pub mod url_signer;
