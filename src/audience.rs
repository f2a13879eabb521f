// =============================================================================
// WAITLIST & NEWSLETTER
// =============================================================================
// Email audiences outside the order flow: buyers waiting for a restock and
// newsletter subscribers. Addresses are stored trimmed and lowercased.
//
// Waitlist notification keeps no per-entry "notified" state: every call
// emails every entry again.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::ledger::StockLedger;
use crate::models::{Subscriber, WaitlistEntry};
use crate::notify::Notifier;
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub notified: usize,
}

fn normalize_email(email: &str) -> AppResult<String> {
    let email = email.trim().to_lowercase();
    if !validator::validate_email(email.as_str()) {
        return Err(AppError::Validation(
            "Valid email address is required".to_string(),
        ));
    }
    Ok(email)
}

#[derive(Clone)]
pub struct AudienceService {
    store: Arc<dyn Store>,
    ledger: StockLedger,
    notifier: Notifier,
}

impl AudienceService {
    pub fn new(store: Arc<dyn Store>, ledger: StockLedger, notifier: Notifier) -> Self {
        Self {
            store,
            ledger,
            notifier,
        }
    }

    // -------------------------------------------------------------------------
    // WAITLIST
    // -------------------------------------------------------------------------

    /// Add or refresh an entry; the email is the key.
    pub async fn join_waitlist(
        &self,
        email: &str,
        buyer_id: Option<&str>,
    ) -> AppResult<WaitlistEntry> {
        let email = normalize_email(email)?;
        let entry = self.store.upsert_waitlist(&email, buyer_id).await?;
        tracing::info!(email = %entry.email, "Waitlist entry saved");
        Ok(entry)
    }

    pub async fn list_waitlist(&self) -> AppResult<Vec<WaitlistEntry>> {
        self.store.list_waitlist().await
    }

    /// Email every waitlist entry when units are on hand. Returns the number
    /// of messages delivered.
    pub async fn notify_waitlist(&self) -> AppResult<usize> {
        let product = self.ledger.product(self.ledger.default_product_id()).await?;
        if product.stock <= 0 {
            tracing::info!(product_id = %product.id, "No stock on hand, waitlist not notified");
            return Ok(0);
        }

        let entries = self.store.list_waitlist().await?;
        let mut notified = 0;
        for entry in &entries {
            if self.notifier.back_in_stock(&entry.email).await {
                notified += 1;
            }
        }
        tracing::info!(notified, total = entries.len(), "Waitlist notified");
        Ok(notified)
    }

    // -------------------------------------------------------------------------
    // NEWSLETTER
    // -------------------------------------------------------------------------

    pub async fn subscribe(&self, email: &str) -> AppResult<SubscriptionResponse> {
        let email = normalize_email(email)?;

        let message = match self.store.find_subscriber(&email).await? {
            Some(existing) if existing.is_active => {
                return Err(AppError::Validation(
                    "This email is already subscribed".to_string(),
                ));
            }
            Some(_) => {
                self.store.set_subscription(&email, true, Utc::now()).await?;
                "Successfully resubscribed to newsletter"
            }
            None => {
                self.store.insert_subscriber(&email).await?;
                "Successfully subscribed to newsletter"
            }
        };

        self.notifier.newsletter_welcome(&email).await;
        tracing::info!(email = %email, "Newsletter subscription active");
        Ok(SubscriptionResponse {
            success: true,
            message: message.to_string(),
        })
    }

    pub async fn unsubscribe(&self, email: &str) -> AppResult<Subscriber> {
        let email = normalize_email(email)?;
        let subscriber = self
            .store
            .set_subscription(&email, false, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound("Subscriber not found".to_string()))?;
        tracing::info!(email = %email, "Newsletter unsubscribed");
        Ok(subscriber)
    }

    pub async fn list_subscribers(&self, active_only: bool) -> AppResult<Vec<Subscriber>> {
        self.store.list_subscribers(active_only).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InventoryUpdate;
    use crate::notify::testing::RecordingMailer;
    use crate::orders::testing::{harness, Harness};

    fn audience(h: &Harness) -> (AudienceService, Arc<RecordingMailer>) {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "shop@example.com".into(), "Clock".into());
        (
            AudienceService::new(h.store.clone(), h.ledger.clone(), notifier),
            mailer,
        )
    }

    #[tokio::test]
    async fn waitlist_upserts_by_email() {
        let h = harness();
        let (audience, _) = audience(&h);

        audience.join_waitlist("Fan@Example.com ", None).await.unwrap();
        audience.join_waitlist("fan@example.com", Some("user_9")).await.unwrap();

        let entries = audience.list_waitlist().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].email, "fan@example.com");
        assert_eq!(entries[0].buyer_id.as_deref(), Some("user_9"));

        assert!(matches!(
            audience.join_waitlist("nope", None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn notify_requires_stock_and_repeats_for_everyone() {
        let h = harness();
        let (audience, mailer) = audience(&h);
        audience.join_waitlist("a@example.com", None).await.unwrap();
        audience.join_waitlist("b@example.com", None).await.unwrap();

        h.ledger
            .update("clock-default", &InventoryUpdate { stock: Some(0), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(audience.notify_waitlist().await.unwrap(), 0);

        h.ledger
            .update("clock-default", &InventoryUpdate { stock: Some(3), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(audience.notify_waitlist().await.unwrap(), 2);
        assert_eq!(audience.notify_waitlist().await.unwrap(), 2);
        assert_eq!(mailer.sent_to("a@example.com"), 2);
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_resubscribe() {
        let h = harness();
        let (audience, mailer) = audience(&h);

        let first = audience.subscribe("reader@example.com").await.unwrap();
        assert_eq!(first.message, "Successfully subscribed to newsletter");

        let dup = audience.subscribe("READER@example.com").await.unwrap_err();
        assert!(matches!(dup, AppError::Validation(ref m) if m.contains("already subscribed")));

        let gone = audience.unsubscribe("reader@example.com").await.unwrap();
        assert!(!gone.is_active);
        assert!(audience.list_subscribers(true).await.unwrap().is_empty());
        assert_eq!(audience.list_subscribers(false).await.unwrap().len(), 1);

        let back = audience.subscribe("reader@example.com").await.unwrap();
        assert_eq!(back.message, "Successfully resubscribed to newsletter");
        assert_eq!(mailer.sent_to("reader@example.com"), 2);

        assert!(matches!(
            audience.unsubscribe("stranger@example.com").await,
            Err(AppError::NotFound(_))
        ));
    }
}
