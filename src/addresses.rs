// =============================================================================
// SAVED ADDRESSES
// =============================================================================
// Shipping contacts a buyer keeps for later checkouts. At most one address
// per buyer is the default; saving a new default clears the previous one.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::models::{AddressInput, SavedAddress};
use crate::store::Store;

#[derive(Clone)]
pub struct AddressBook {
    store: Arc<dyn Store>,
}

impl AddressBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Default first, then newest.
    pub async fn list(&self, buyer_id: &str) -> AppResult<Vec<SavedAddress>> {
        self.store.list_addresses(buyer_id).await
    }

    pub async fn create(&self, buyer_id: &str, input: AddressInput) -> AppResult<SavedAddress> {
        input.contact.validate()?;
        let address = SavedAddress {
            id: Uuid::new_v4(),
            buyer_id: buyer_id.to_string(),
            label: input.label,
            contact: input.contact,
            is_default: input.is_default,
            created_at: Utc::now(),
        };
        let address = self.store.insert_address(&address).await?;
        tracing::debug!(buyer_id, address_id = %address.id, "Address saved");
        Ok(address)
    }

    pub async fn update(
        &self,
        buyer_id: &str,
        id: Uuid,
        input: AddressInput,
    ) -> AppResult<SavedAddress> {
        input.contact.validate()?;
        self.store
            .update_address(buyer_id, id, &input)
            .await?
            .ok_or_else(|| AppError::NotFound("Address not found".to_string()))
    }

    pub async fn delete(&self, buyer_id: &str, id: Uuid) -> AppResult<()> {
        if !self.store.delete_address(buyer_id, id).await? {
            return Err(AppError::NotFound("Address not found".to_string()));
        }
        Ok(())
    }
}
