//! Payment card secrets stored as encrypted JSON documents.

use keeper_core::{KeeperError, KeeperResult};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::repository::{TransferOptions, VaultRepository};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub number: String,
    pub date: String,
    pub cvv: String,
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card")
            .field("number", &"[REDACTED]")
            .field("date", &self.date)
            .field("cvv", &"[REDACTED]")
            .finish()
    }
}

impl Card {
    /// Vault name: `card_<digits of number>.json`.
    pub fn file_name(&self) -> KeeperResult<String> {
        let digits: String = self.number.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(KeeperError::InvalidName(format!(
                "card number {:?} has no digits",
                self.number
            )));
        }
        Ok(format!("card_{digits}.json"))
    }
}

/// Encrypt `card` into the vault. Returns the blob name.
pub async fn store_card(
    repo: &VaultRepository,
    card: &Card,
    password: &SecretString,
) -> KeeperResult<String> {
    let name = card.file_name()?;
    let json = serde_json::to_vec(card).map_err(|e| KeeperError::Other(e.into()))?;
    repo.encrypt_reader(json.as_slice(), &name, password, TransferOptions::default())
        .await?;
    tracing::info!(name = %name, "card stored");
    Ok(name)
}

pub async fn load_card(
    repo: &VaultRepository,
    name: &str,
    password: &SecretString,
) -> KeeperResult<Card> {
    let mut json = Vec::new();
    repo.decrypt_to_writer(name, &mut json, password, TransferOptions::default())
        .await?;
    serde_json::from_slice(&json).map_err(|e| KeeperError::Decode(format!("card {name}: {e}")))
}
