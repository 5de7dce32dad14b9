use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use uuid::Uuid;

/// Stream of bytes for file content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Boxed stream of outcomes, one item per file
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Symbols used for generated file ids. Look-alikes (I, O, l, o, q, 0, 1, 9) are left out.
pub const ID_POOL: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnprstuvwxyz2345678";

/// Externally assigned account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Short public identifier of a stored file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub String);

impl FileId {
    /// Generate a random id of `length` symbols from [`ID_POOL`]
    pub fn generate<R: Rng + ?Sized>(length: usize, rng: &mut R) -> Self {
        let id = (0..length)
            .map(|_| ID_POOL[rng.gen_range(0..ID_POOL.len())] as char)
            .collect();
        Self(id)
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Client-chosen identifier shared by the requests of one resumable upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Quota-tracked owner of files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub token: String,
    pub bytes_used: u64,
    pub upload_count: u64,
    pub upload_bytes_total: u64,
    pub download_count: u64,
    pub download_bytes_total: u64,
    pub created_at: DateTime<Utc>,
    pub last_upload_at: Option<DateTime<Utc>>,
    pub last_download_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Fresh account with zeroed counters and a new token
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            token: Uuid::new_v4().to_string(),
            bytes_used: 0,
            upload_count: 0,
            upload_bytes_total: 0,
            download_count: 0,
            download_bytes_total: 0,
            created_at: Utc::now(),
            last_upload_at: None,
            last_download_at: None,
        }
    }
}

/// Account counters as shown to the account holder. The token is never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub id: AccountId,
    pub bytes_used: u64,
    pub available_bytes: u64,
    pub upload_count: u64,
    pub upload_bytes_total: u64,
    pub download_count: u64,
    pub download_bytes_total: u64,
    pub created_at: DateTime<Utc>,
    pub last_upload_at: Option<DateTime<Utc>>,
    pub last_download_at: Option<DateTime<Utc>>,
}

impl AccountSummary {
    pub fn from_account(account: &Account, max_account_bytes: u64) -> Self {
        Self {
            id: account.id.clone(),
            bytes_used: account.bytes_used,
            available_bytes: max_account_bytes.saturating_sub(account.bytes_used),
            upload_count: account.upload_count,
            upload_bytes_total: account.upload_bytes_total,
            download_count: account.download_count,
            download_bytes_total: account.download_bytes_total,
            created_at: account.created_at,
            last_upload_at: account.last_upload_at,
            last_download_at: account.last_download_at,
        }
    }
}

/// Metadata row describing one stored file.
///
/// `name` is whatever the uploader sent; never build paths from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub owner: AccountId,
    pub name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub download_count: u64,
    pub last_download_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn new(id: FileId, owner: AccountId, name: String, size: u64) -> Self {
        Self {
            id,
            owner,
            name,
            size,
            uploaded_at: Utc::now(),
            download_count: 0,
            last_download_at: None,
        }
    }
}

/// Public reference handed back after a committed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: FileId,
    pub url: String,
    pub name: String,
    pub size: u64,
    pub available_bytes: u64,
}

/// How a read locates a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    /// Share-link access by file id alone
    Public,
    /// Only files owned by this account are visible
    Owner(AccountId),
}

impl FileLookup {
    pub(crate) fn admits(&self, record: &FileRecord) -> bool {
        match self {
            Self::Public => true,
            Self::Owner(account) => &record.owner == account,
        }
    }
}
