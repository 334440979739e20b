//! Outgoing mail for verification codes

use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::{OsRng, RngCore};
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::config::SmtpConfig;

/// Sends mail over SMTP, or logs it when no SMTP host is configured
pub struct EmailService {
    smtp: SmtpConfig,
}

impl EmailService {
    pub fn new(smtp: SmtpConfig) -> Self {
        Self { smtp }
    }

    /// Whether mail actually leaves the process
    pub fn is_configured(&self) -> bool {
        self.smtp
            .host
            .as_deref()
            .is_some_and(|host| !host.trim().is_empty())
    }

    /// Send the account verification code
    pub async fn send_verification_code(
        &self,
        to_email: &str,
        code: &str,
        ttl_minutes: i64,
    ) -> Result<()> {
        let Some(host) = self.smtp.host.as_deref().filter(|h| !h.trim().is_empty()) else {
            tracing::info!(email = %to_email, code = %code, "SMTP not configured, verification code logged");
            return Ok(());
        };

        let body = format!(
            "Your Akimori verification code: {}\n\nThe code is valid for {} minutes.\n\
             If you did not sign up, ignore this email.",
            code, ttl_minutes
        );

        let email = Message::builder()
            .from(
                self.smtp
                    .from
                    .parse()
                    .map_err(|e| anyhow!("Invalid from address: {}", e))?,
            )
            .to(to_email
                .parse()
                .map_err(|e| anyhow!("Invalid to address: {}", e))?)
            .subject("Akimori email verification")
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| anyhow!("Failed to build email: {}", e))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| anyhow!("Failed to create SMTP transport: {}", e))?
            .port(self.smtp.port);
        if let (Some(username), Some(password)) = (&self.smtp.username, &self.smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        builder
            .build()
            .send(email)
            .await
            .map_err(|e| anyhow!("Failed to send email: {}", e))?;

        tracing::info!(email = %to_email, "Verification code sent");
        Ok(())
    }
}

/// A random 6-digit code, zero padded
pub fn generate_verification_code() -> String {
    format!("{:06}", OsRng.next_u32() % 1_000_000)
}
