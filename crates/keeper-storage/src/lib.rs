//! keeper-storage: the local side of the vault
//!
//! A [`VaultRepository`] is a flat namespace of named blobs under one
//! directory. [`StorageLayout`] carves the client state tree into per-user
//! blob repositories plus token and checkpoint areas.

pub mod card;
pub mod layout;
pub mod repository;
pub mod token;

pub use card::{load_card, store_card, Card};
pub use layout::StorageLayout;
pub use repository::{validate_name, TransferOptions, VaultRepository, TMP_SUFFIX};
pub use token::TokenStore;
