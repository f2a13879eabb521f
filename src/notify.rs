// =============================================================================
// NOTIFICATIONS
// =============================================================================
// Transactional email for the storefront. Delivery is fire-and-forget from the
// caller's point of view: a failed send is logged and reported as `false`,
// never as an error, so it cannot roll back the state change that triggered it.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::Order;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Writes every message to the structured log instead of delivering it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            "Email dispatched to log transport"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    sender: String,
    product_name: String,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, sender: String, product_name: String) -> Self {
        Self {
            mailer,
            sender,
            product_name,
        }
    }

    async fn deliver(&self, to: &str, subject: String, body: String) -> bool {
        let message = EmailMessage {
            from: self.sender.clone(),
            to: to.to_string(),
            subject,
            body,
        };
        match self.mailer.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, to, subject = %message.subject, "Email delivery failed");
                false
            }
        }
    }

    pub async fn order_confirmation(&self, order: &Order) -> bool {
        let body = format!(
            "Hi {},\n\nThanks for your order of {} x {}.\nOrder: {}\nTotal charged: {} {}\n\nWe will email you again when it ships.",
            order.shipping.shipping_name,
            order.quantity,
            self.product_name,
            order.id,
            format_minor(order.amount_paid.unwrap_or_else(|| order.payable_amount())),
            order.currency.to_uppercase(),
        );
        self.deliver(
            &order.shipping.shipping_email,
            format!("Order confirmed: {}", order.id),
            body,
        )
        .await
    }

    pub async fn shipping_notice(&self, order: &Order) -> bool {
        let tracking = order.tracking_number.as_deref().unwrap_or("pending");
        let body = format!(
            "Hi {},\n\nYour {} is on its way.\nOrder: {}\nTracking number: {}",
            order.shipping.shipping_name, self.product_name, order.id, tracking,
        );
        self.deliver(
            &order.shipping.shipping_email,
            format!("Your order {} has shipped", order.id),
            body,
        )
        .await
    }

    pub async fn back_in_stock(&self, email: &str) -> bool {
        let body = format!(
            "Good news: the {} is back in stock. Stock is limited, so order soon.",
            self.product_name
        );
        self.deliver(email, format!("{} is back in stock", self.product_name), body)
            .await
    }

    pub async fn newsletter_welcome(&self, email: &str) -> bool {
        let body = format!(
            "You're subscribed to {} news. Unsubscribe any time.",
            self.product_name
        );
        self.deliver(email, "Welcome to the newsletter".to_string(), body)
            .await
    }
}

/// 29900 -> "299.00"
fn format_minor(amount: i64) -> String {
    format!("{}.{:02}", amount / 100, (amount % 100).abs())
}

// =============================================================================
// TEST TRANSPORT
// =============================================================================
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Captures messages; can be switched to fail every send.
    #[derive(Default)]
    pub struct RecordingMailer {
        sent: Mutex<Vec<EmailMessage>>,
        failing: AtomicBool,
    }

    impl RecordingMailer {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().clone()
        }

        pub fn sent_to(&self, to: &str) -> usize {
            self.sent.lock().iter().filter(|m| m.to == to).count()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("smtp relay refused connection");
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingMailer;
    use super::*;

    #[test]
    fn minor_units_render_with_two_decimals() {
        assert_eq!(format_minor(29900), "299.00");
        assert_eq!(format_minor(905), "9.05");
        assert_eq!(format_minor(0), "0.00");
    }

    #[tokio::test]
    async fn failed_delivery_reports_false() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "shop@example.com".into(), "Clock".into());

        assert!(notifier.newsletter_welcome("a@example.com").await);
        mailer.set_failing(true);
        assert!(!notifier.back_in_stock("a@example.com").await);
        assert_eq!(mailer.sent().len(), 1);
        assert_eq!(mailer.sent()[0].from, "shop@example.com");
    }
}
