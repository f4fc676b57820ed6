//! SQLite persistence for CRM credentials.

pub mod credentials;
pub mod init;


pub use credentials::CredentialRepository;
pub use init::{init_db, migrate, open_db};
