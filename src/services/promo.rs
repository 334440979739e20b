//! Promo code service
//!
//! Manual redemption applies a promo at once. Top-up promos are reserved
//! against a payment and applied or cancelled when the payment settles.
//! Every operation locks the promo row for its whole transaction.
//!
//! Rejections carry a [`PromoReason`]. When a rejection follows a terminal
//! state change (a lapsed reservation marked EXPIRED, a failed re-check
//! marked CANCELLED) the change is committed before the error is returned.

use crate::db::repositories::{ItemRepository, PromoRepository};
use crate::db::{DbTx, DynDatabasePool};
use crate::models::{
    normalize_code, CreatePromoInput, InventorySource, PromoCode, PromoEffect, PromoReason,
    PromoRedemption, PromoView, RedemptionContext, RedemptionStatus, PROMO_CODE_MAX_LEN,
    USER_AGENT_MAX_LEN,
};
use crate::services::economy::{deposit_in, EconomyError};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PromoError {
    #[error("{0}")]
    Rejected(PromoReason),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Promo code '{0}' already exists")]
    CodeExists(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<PromoReason> for PromoError {
    fn from(reason: PromoReason) -> Self {
        PromoError::Rejected(reason)
    }
}

impl From<EconomyError> for PromoError {
    fn from(err: EconomyError) -> Self {
        match err {
            EconomyError::IdempotencyConflict => {
                PromoError::Rejected(PromoReason::IdempotencyKeyConflict)
            }
            EconomyError::Validation(msg) => PromoError::Validation(msg),
            EconomyError::Internal(e) => PromoError::Internal(e),
            other => PromoError::Internal(anyhow::anyhow!(other.to_string())),
        }
    }
}

/// Where a redemption request came from
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn new(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip: ip.unwrap_or_default(),
            user_agent: user_agent
                .unwrap_or_default()
                .chars()
                .take(USER_AGENT_MAX_LEN)
                .collect(),
        }
    }
}

/// Reservation request for a pending top-up
#[derive(Debug, Clone, Deserialize)]
pub struct ReserveInput {
    pub code: String,
    pub topup_amount_minor: i64,
    pub payment_id: String,
    #[serde(default)]
    pub topup_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub struct PromoService {
    pool: DynDatabasePool,
    promo_repo: Arc<dyn PromoRepository>,
    item_repo: Arc<dyn ItemRepository>,
    reserve_ttl: Duration,
}

impl PromoService {
    pub fn new(
        pool: DynDatabasePool,
        promo_repo: Arc<dyn PromoRepository>,
        item_repo: Arc<dyn ItemRepository>,
        reserve_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            promo_repo,
            item_repo,
            reserve_ttl,
        }
    }

    /// Whether `user_id` could redeem `code` right now
    pub async fn validate(&self, code: &str, user_id: i64) -> Result<PromoView, PromoError> {
        let promo = self.redeemable(code, user_id).await?;
        Ok(PromoView::from(promo))
    }

    /// Preview what a top-up of `topup_amount_minor` would get with `code`.
    /// Nothing is written.
    pub async fn quote_topup(
        &self,
        code: &str,
        user_id: i64,
        topup_amount_minor: i64,
    ) -> Result<Value, PromoError> {
        if topup_amount_minor <= 0 {
            return Err(PromoReason::TopupAmountRequired.into());
        }
        let promo = self.redeemable(code, user_id).await?;
        match &promo.effect {
            Some(PromoEffect::TopupDiscount(discount)) => {
                let quote = discount.quote(topup_amount_minor)?;
                Ok(json!({
                    "type": "topup_discount",
                    "currency": discount.currency,
                    "quote": quote,
                }))
            }
            Some(PromoEffect::BalanceBonus(bonus)) => {
                let bonus_minor = bonus.bonus_minor(Some(topup_amount_minor))?;
                Ok(json!({
                    "type": "balance_bonus",
                    "currency": bonus.currency,
                    "topup_amount_minor": topup_amount_minor,
                    "bonus_minor": bonus_minor,
                }))
            }
            Some(PromoEffect::ItemGrant(grant)) => Ok(json!({
                "type": "item_grant",
                "item_id": grant.item_id,
            })),
            None => Err(PromoReason::PromoHasNoEffect.into()),
        }
    }

    /// Redeem a promo outside of a payment. The effect is applied at once;
    /// any failure rolls the whole redemption back.
    pub async fn redeem_manual(
        &self,
        code: &str,
        user_id: i64,
        client: ClientInfo,
    ) -> Result<PromoRedemption, PromoError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(PromoReason::PromoRequired.into());
        }

        let mut tx = self.pool.begin().await?;
        let promo = tx
            .promo_lock_by_code(&code)
            .await?
            .ok_or(PromoReason::PromoNotFound)?;
        let applied = tx.redemption_applied_count(promo.id, user_id).await?;
        let now = Utc::now();
        promo.check_redeemable(applied, now)?;

        let mut redemption = PromoRedemption::new(
            promo.id,
            user_id,
            RedemptionStatus::Applied,
            RedemptionContext::Manual,
            now,
        );
        redemption.ip = client.ip;
        redemption.user_agent = client.user_agent;
        let mut redemption = tx.redemption_insert(&redemption).await?;

        redemption.payload = apply_effect(tx.as_mut(), &redemption, &promo, None).await?;
        tx.redemption_update(&redemption).await?;
        tx.promo_increment_uses(promo.id).await?;
        tx.commit().await?;

        tracing::info!(promo = %promo.code, user_id, redemption_id = redemption.id, "Promo redeemed");
        Ok(redemption)
    }

    /// Hold a promo for a pending top-up. `uses_count` is not touched until
    /// the payment succeeds.
    ///
    /// # Errors
    ///
    /// `Rejected` with the reason the promo cannot be reserved. Stale
    /// reservations expired along the way stay expired.
    pub async fn reserve(
        &self,
        user_id: i64,
        input: ReserveInput,
        client: ClientInfo,
    ) -> Result<PromoRedemption, PromoError> {
        let code = normalize_code(&input.code);
        if code.is_empty() {
            return Err(PromoReason::PromoRequired.into());
        }
        let payment_id = input.payment_id.trim().to_string();
        if payment_id.is_empty() {
            return Err(PromoReason::PaymentIdRequired.into());
        }
        if input.topup_amount_minor <= 0 {
            return Err(PromoReason::TopupAmountRequired.into());
        }
        let idempotency_key = input
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        let mut redemption = PromoRedemption::new(
            0,
            user_id,
            RedemptionStatus::Pending,
            RedemptionContext::Topup,
            Utc::now(),
        );
        redemption.topup_amount_minor = Some(input.topup_amount_minor);
        redemption.payment_id = payment_id;
        redemption.topup_id = input.topup_id.unwrap_or_default().trim().to_string();
        redemption.idempotency_key = idempotency_key;
        redemption.reserved_until = Some(redemption.redeemed_at + self.reserve_ttl);
        redemption.ip = client.ip;
        redemption.user_agent = client.user_agent;

        let mut tx = self.pool.begin().await?;
        let outcome = reserve_in(tx.as_mut(), &code, redemption).await?;
        tx.commit().await?;

        let redemption = outcome?;
        tracing::info!(
            promo = %code,
            user_id,
            redemption_id = redemption.id,
            payment_id = %redemption.payment_id,
            "Promo reserved"
        );
        Ok(redemption)
    }

    /// Settle a reservation after its payment of `paid_amount_minor`
    /// succeeded. Bonuses are computed from the paid amount; a discounted
    /// top-up must have been paid at exactly the quoted price. Replays return
    /// the APPLIED redemption unchanged.
    pub async fn apply_after_payment(
        &self,
        payment_id: &str,
        paid_amount_minor: i64,
    ) -> Result<PromoRedemption, PromoError> {
        let payment_id = payment_id.trim();
        if payment_id.is_empty() {
            return Err(PromoReason::PaymentIdRequired.into());
        }
        if paid_amount_minor <= 0 {
            return Err(PromoReason::PaymentAmountRequired.into());
        }

        let mut tx = self.pool.begin().await?;
        let outcome = apply_after_payment_in(tx.as_mut(), payment_id, paid_amount_minor).await?;
        tx.commit().await?;

        let redemption = outcome?;
        tracing::info!(
            payment_id,
            paid_amount_minor,
            redemption_id = redemption.id,
            "Promo applied after payment"
        );
        Ok(redemption)
    }

    /// Release a reservation whose payment failed. Returns `None` if nothing
    /// is attached to the payment.
    pub async fn cancel_reservation(
        &self,
        payment_id: &str,
    ) -> Result<Option<PromoRedemption>, PromoError> {
        let payment_id = payment_id.trim();
        if payment_id.is_empty() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;
        let Some(mut redemption) = tx.redemption_latest_for_payment(payment_id).await? else {
            return Ok(None);
        };
        if redemption.status == RedemptionStatus::Applied {
            return Ok(Some(redemption));
        }
        redemption.status = RedemptionStatus::Cancelled;
        tx.redemption_update(&redemption).await?;
        tx.commit().await?;

        tracing::info!(payment_id, redemption_id = redemption.id, "Promo reservation cancelled");
        Ok(Some(redemption))
    }

    /// Admin: create a promo code
    pub async fn create(&self, mut input: CreatePromoInput) -> Result<PromoView, PromoError> {
        input.code = normalize_code(&input.code);
        if input.code.is_empty() || input.code.chars().count() > PROMO_CODE_MAX_LEN {
            return Err(PromoError::Validation(format!(
                "Code must be 1 to {} characters",
                PROMO_CODE_MAX_LEN
            )));
        }
        if input.max_total_uses < 1 || input.max_uses_per_user < 1 {
            return Err(PromoError::Validation(
                "Use limits must be at least 1".to_string(),
            ));
        }
        if let (Some(starts), Some(ends)) = (input.starts_at, input.ends_at) {
            if ends < starts {
                return Err(PromoError::Validation(
                    "Promo window ends before it starts".to_string(),
                ));
            }
        }
        if let Some(effect) = &input.effect {
            effect.validate().map_err(PromoError::Validation)?;
            if let PromoEffect::ItemGrant(grant) = effect {
                if self.item_repo.get_by_id(grant.item_id).await?.is_none() {
                    return Err(PromoError::Validation(format!(
                        "Item {} does not exist",
                        grant.item_id
                    )));
                }
            }
        }
        if self.promo_repo.get_by_code(&input.code).await?.is_some() {
            return Err(PromoError::CodeExists(input.code));
        }

        let promo = self.promo_repo.create(&input).await?;
        tracing::info!(promo = %promo.code, "Promo created");
        Ok(PromoView::from(promo))
    }

    async fn redeemable(&self, code: &str, user_id: i64) -> Result<PromoCode, PromoError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(PromoReason::PromoRequired.into());
        }
        let promo = self
            .promo_repo
            .get_by_code(&code)
            .await?
            .ok_or(PromoReason::PromoNotFound)?;
        let applied = self.promo_repo.applied_count(promo.id, user_id).await?;
        promo.check_redeemable(applied, Utc::now())?;
        Ok(promo)
    }
}

/// Give the user what the promo grants and return the payload describing it
async fn apply_effect(
    tx: &mut dyn DbTx,
    redemption: &PromoRedemption,
    promo: &PromoCode,
    topup_amount_minor: Option<i64>,
) -> Result<Value, PromoError> {
    match &promo.effect {
        Some(PromoEffect::BalanceBonus(bonus)) => {
            let amount = bonus.bonus_minor(topup_amount_minor)?;
            if amount <= 0 {
                return Err(PromoReason::BonusIsZero.into());
            }
            let wallet = tx
                .wallet_get_or_create(redemption.user_id, bonus.currency)
                .await?;
            deposit_in(
                tx,
                wallet.id,
                amount,
                &format!("Promo {}", promo.code),
                Some(&format!("promo:{}", redemption.id)),
            )
            .await?;
            Ok(json!({
                "type": "balance_bonus",
                "currency": bonus.currency,
                "amount_minor": amount,
            }))
        }
        Some(PromoEffect::ItemGrant(grant)) => {
            if tx.inventory_owned(redemption.user_id, grant.item_id).await? {
                return Err(PromoReason::ItemAlreadyOwned.into());
            }
            tx.item_lock(grant.item_id).await?.ok_or_else(|| {
                PromoError::Internal(anyhow::anyhow!(
                    "Promo {} grants missing item {}",
                    promo.code,
                    grant.item_id
                ))
            })?;
            tx.inventory_grant(
                redemption.user_id,
                grant.item_id,
                InventorySource::Gift,
                &format!("promo {}", promo.code),
            )
            .await?;
            Ok(json!({
                "type": "item_grant",
                "item_id": grant.item_id,
            }))
        }
        Some(PromoEffect::TopupDiscount(_)) => {
            Err(PromoReason::TopupDiscountRequiresQuote.into())
        }
        None => Err(PromoReason::PromoHasNoEffect.into()),
    }
}

/// Reservation body. The outer `Result` aborts the transaction; the inner
/// one is a rejection whose writes are still committed.
async fn reserve_in(
    tx: &mut dyn DbTx,
    code: &str,
    mut redemption: PromoRedemption,
) -> Result<Result<PromoRedemption, PromoReason>, PromoError> {
    let now = redemption.redeemed_at;

    if let Some(key) = redemption.idempotency_key.as_deref() {
        if let Some(existing) = tx.redemption_by_key(key).await? {
            if existing.user_id != redemption.user_id {
                return Ok(Err(PromoReason::IdempotencyKeyConflict));
            }
            return Ok(Ok(existing));
        }
    }

    // A payment id belongs to the first user who reserved against it
    if let Some(holder) = tx
        .redemption_latest_for_payment(&redemption.payment_id)
        .await?
    {
        if holder.user_id != redemption.user_id {
            return Ok(Err(PromoReason::PaymentIdConflict));
        }
    }

    let Some(promo) = tx.promo_lock_by_code(code).await? else {
        return Ok(Err(PromoReason::PromoNotFound));
    };
    let applied = tx
        .redemption_applied_count(promo.id, redemption.user_id)
        .await?;
    if let Err(reason) = promo.check_redeemable(applied, now) {
        return Ok(Err(reason));
    }

    let mut active = Vec::new();
    for mut pending in tx.redemptions_pending(promo.id).await? {
        if is_lapsed(&pending, now) {
            pending.status = RedemptionStatus::Expired;
            tx.redemption_update(&pending).await?;
        } else {
            active.push(pending);
        }
    }
    if promo.uses_count + active.len() as i64 >= promo.max_total_uses {
        return Ok(Err(PromoReason::PromoLimitReached));
    }
    if let Some(own) = active
        .into_iter()
        .filter(|pending| pending.user_id == redemption.user_id)
        .max_by_key(|pending| (pending.redeemed_at, pending.id))
    {
        return Ok(Ok(own));
    }

    redemption.promo_id = promo.id;
    let mut redemption = tx.redemption_insert(&redemption).await?;
    let topup = redemption.topup_amount_minor.unwrap_or_default();

    let mut rejection = None;
    redemption.payload = match &promo.effect {
        Some(PromoEffect::TopupDiscount(discount)) => match discount.quote(topup) {
            Ok(quote) => json!({ "type": "topup_discount", "quote": quote }),
            Err(reason) => {
                redemption.status = RedemptionStatus::Cancelled;
                rejection = Some(reason);
                json!({
                    "type": "topup_discount",
                    "quote": { "ok": false, "reason": reason.as_str() },
                })
            }
        },
        Some(PromoEffect::BalanceBonus(bonus)) => json!({
            "type": "balance_bonus_pending",
            "currency": bonus.currency,
            "topup_amount_minor": topup,
            "bonus_minor": bonus.bonus_minor(Some(topup)).unwrap_or(0),
        }),
        Some(PromoEffect::ItemGrant(grant)) => json!({
            "type": "item_grant_pending",
            "item_id": grant.item_id,
        }),
        None => json!({}),
    };
    tx.redemption_update(&redemption).await?;

    Ok(match rejection {
        Some(reason) => Err(reason),
        None => Ok(redemption),
    })
}

/// Settlement body, same contract as [`reserve_in`]
async fn apply_after_payment_in(
    tx: &mut dyn DbTx,
    payment_id: &str,
    paid_amount_minor: i64,
) -> Result<Result<PromoRedemption, PromoReason>, PromoError> {
    let now = Utc::now();
    let Some(mut redemption) = tx.redemption_latest_for_payment(payment_id).await? else {
        return Ok(Err(PromoReason::RedemptionNotFound));
    };

    match redemption.status {
        RedemptionStatus::Applied => return Ok(Ok(redemption)),
        RedemptionStatus::Cancelled | RedemptionStatus::Expired => {
            return Ok(Err(PromoReason::RedemptionNotActive))
        }
        RedemptionStatus::Pending => {}
    }

    if is_lapsed(&redemption, now) {
        redemption.status = RedemptionStatus::Expired;
        tx.redemption_update(&redemption).await?;
        return Ok(Err(PromoReason::ReservationExpired));
    }

    let promo = tx
        .promo_lock(redemption.promo_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Redemption {} has no promo", redemption.id))?;
    let applied = tx
        .redemption_applied_count(promo.id, redemption.user_id)
        .await?;
    if let Err(reason) = promo.check_redeemable(applied, now) {
        redemption.status = RedemptionStatus::Cancelled;
        tx.redemption_update(&redemption).await?;
        return Ok(Err(reason));
    }

    match &promo.effect {
        // The discount was already taken off the payment
        Some(PromoEffect::TopupDiscount(_)) => {
            let payable = redemption.payload["quote"]["payable_minor"].as_i64();
            if payable != Some(paid_amount_minor) {
                tracing::warn!(
                    payment_id,
                    paid_amount_minor,
                    expected = ?payable,
                    "Discounted top-up paid at the wrong price"
                );
                return Ok(Err(PromoReason::PaymentAmountMismatch));
            }
        }
        Some(PromoEffect::BalanceBonus(_)) => {
            redemption.topup_amount_minor = Some(paid_amount_minor);
            redemption.payload =
                apply_effect(tx, &redemption, &promo, Some(paid_amount_minor)).await?;
        }
        Some(PromoEffect::ItemGrant(_)) => {
            redemption.payload = apply_effect(tx, &redemption, &promo, None).await?;
        }
        None => {}
    }

    redemption.status = RedemptionStatus::Applied;
    redemption.applied_at = Some(now);
    tx.redemption_update(&redemption).await?;
    tx.promo_increment_uses(promo.id).await?;
    Ok(Ok(redemption))
}

fn is_lapsed(redemption: &PromoRedemption, now: DateTime<Utc>) -> bool {
    matches!(redemption.reserved_until, Some(until) if until < now)
}
