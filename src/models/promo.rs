//! Promo code models
//!
//! A promo code carries at most one effect. Decimal effect values are kept as
//! fixed-point hundredths ([`Hundredths`]) so that all money math is integer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::Currency;

/// Maximum length of a promo code
pub const PROMO_CODE_MAX_LEN: usize = 32;

/// Maximum stored user agent length
pub const USER_AGENT_MAX_LEN: usize = 255;

/// Normalize user input into the stored form of a code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Why a promo operation was refused. Serialized as a short snake_case code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoReason {
    PromoRequired,
    PaymentIdRequired,
    PromoNotFound,
    PromoInactive,
    PromoExpiredOrNotStarted,
    PromoLimitReached,
    AlreadyRedeemed,
    TopupAmountRequired,
    TopupTooSmall,
    BonusIsZero,
    ItemAlreadyOwned,
    TopupDiscountRequiresQuote,
    PromoHasNoEffect,
    RedemptionNotFound,
    RedemptionNotActive,
    ReservationExpired,
    IdempotencyKeyConflict,
    PaymentIdConflict,
    PaymentAmountRequired,
    PaymentAmountMismatch,
}

impl PromoReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromoReason::PromoRequired => "promo_required",
            PromoReason::PaymentIdRequired => "payment_id_required",
            PromoReason::PromoNotFound => "promo_not_found",
            PromoReason::PromoInactive => "promo_inactive",
            PromoReason::PromoExpiredOrNotStarted => "promo_expired_or_not_started",
            PromoReason::PromoLimitReached => "promo_limit_reached",
            PromoReason::AlreadyRedeemed => "already_redeemed",
            PromoReason::TopupAmountRequired => "topup_amount_required",
            PromoReason::TopupTooSmall => "topup_too_small",
            PromoReason::BonusIsZero => "bonus_is_zero",
            PromoReason::ItemAlreadyOwned => "item_already_owned",
            PromoReason::TopupDiscountRequiresQuote => "topup_discount_requires_quote",
            PromoReason::PromoHasNoEffect => "promo_has_no_effect",
            PromoReason::RedemptionNotFound => "redemption_not_found",
            PromoReason::RedemptionNotActive => "redemption_not_active",
            PromoReason::ReservationExpired => "reservation_expired",
            PromoReason::IdempotencyKeyConflict => "idempotency_key_conflict",
            PromoReason::PaymentIdConflict => "payment_id_conflict",
            PromoReason::PaymentAmountRequired => "payment_amount_required",
            PromoReason::PaymentAmountMismatch => "payment_amount_mismatch",
        }
    }

    /// Lookup failures map to 404, everything else is a client error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PromoReason::PromoNotFound | PromoReason::RedemptionNotFound
        )
    }
}

impl fmt::Display for PromoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decimal with two fractional digits, stored as an integer count of hundredths.
///
/// Deserializes from a JSON number (`12.5`) or string (`"12.50"`); serializes as
/// a string with exactly two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Hundredths(pub i64);

impl Hundredths {
    pub fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    /// Integer part, truncated toward zero
    pub fn trunc(&self) -> i64 {
        self.0 / 100
    }

    /// `trunc(amount * self / 100)`, i.e. `self` percent of `amount`
    pub fn percent_of(&self, amount: i64) -> i64 {
        let scaled = (amount as i128) * (self.0 as i128) / 10_000;
        scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl fmt::Display for Hundredths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Hundredths {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            anyhow::bail!("Invalid decimal: {:?}", s);
        }
        if frac_part.len() > 2 || !frac_part.chars().all(|c| c.is_ascii_digit()) {
            anyhow::bail!("Invalid decimal: {:?}", s);
        }
        let units: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid decimal: {:?}", s))?
        };
        let frac: i64 = format!("{:0<2}", frac_part)
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid decimal: {:?}", s))?;
        let value = units
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(|| anyhow::anyhow!("Decimal out of range: {:?}", s))?;
        Ok(Self(if negative { -value } else { value }))
    }
}

impl Serialize for Hundredths {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hundredths {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => v
                .checked_mul(100)
                .map(Hundredths)
                .ok_or_else(|| serde::de::Error::custom("decimal out of range")),
            Raw::Float(v) if v.is_finite() => Ok(Hundredths((v * 100.0).round() as i64)),
            Raw::Float(_) => Err(serde::de::Error::custom("decimal must be finite")),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BonusType {
    #[default]
    Fixed,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    Percent,
    Fixed,
}

fn default_aki() -> Currency {
    Currency::Aki
}

fn default_rub() -> Currency {
    Currency::Rub
}

/// Wallet bonus paid out when the promo is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceBonus {
    #[serde(default = "default_aki")]
    pub currency: Currency,
    #[serde(default)]
    pub bonus_type: BonusType,
    pub bonus_value: Hundredths,
    #[serde(default)]
    pub min_topup_minor: Option<i64>,
}

impl BalanceBonus {
    /// Bonus in minor units of `currency`
    pub fn bonus_minor(&self, topup_amount_minor: Option<i64>) -> Result<i64, PromoReason> {
        match self.bonus_type {
            BonusType::Fixed => Ok(self.bonus_value.trunc()),
            BonusType::Percent => {
                let topup = topup_amount_minor.ok_or(PromoReason::TopupAmountRequired)?;
                if matches!(self.min_topup_minor, Some(min) if topup < min) {
                    return Err(PromoReason::TopupTooSmall);
                }
                Ok(self.bonus_value.percent_of(topup))
            }
        }
    }
}

/// Catalog item given to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemGrant {
    pub item_id: i64,
}

/// Discount on a wallet top-up, settled by the payment provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupDiscount {
    #[serde(default = "default_rub")]
    pub currency: Currency,
    pub discount_type: DiscountType,
    pub discount_value: Hundredths,
    #[serde(default)]
    pub min_topup_minor: i64,
    #[serde(default)]
    pub max_discount_minor: Option<i64>,
}

/// Price breakdown of a discounted top-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupQuote {
    pub topup_amount_minor: i64,
    pub discount_minor: i64,
    pub payable_minor: i64,
}

impl TopupDiscount {
    pub fn quote(&self, topup_amount_minor: i64) -> Result<TopupQuote, PromoReason> {
        if topup_amount_minor < self.min_topup_minor {
            return Err(PromoReason::TopupTooSmall);
        }

        let mut discount = match self.discount_type {
            DiscountType::Percent => self.discount_value.percent_of(topup_amount_minor),
            DiscountType::Fixed => self.discount_value.trunc(),
        };
        if let Some(max) = self.max_discount_minor {
            discount = discount.min(max);
        }
        let discount = discount.min(topup_amount_minor).max(0);

        Ok(TopupQuote {
            topup_amount_minor,
            discount_minor: discount,
            payable_minor: topup_amount_minor - discount,
        })
    }
}

/// The single effect a promo code can have
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromoEffect {
    BalanceBonus(BalanceBonus),
    ItemGrant(ItemGrant),
    TopupDiscount(TopupDiscount),
}

impl PromoEffect {
    /// Reject effects whose values can never produce a sensible outcome
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PromoEffect::BalanceBonus(bonus) => {
                if bonus.bonus_value.0 <= 0 {
                    return Err("bonus_value must be positive".into());
                }
            }
            PromoEffect::ItemGrant(grant) => {
                if grant.item_id <= 0 {
                    return Err("item_id is required".into());
                }
            }
            PromoEffect::TopupDiscount(discount) => {
                if discount.discount_value.0 < 0 {
                    return Err("discount_value must not be negative".into());
                }
                if discount.discount_type == DiscountType::Percent
                    && discount.discount_value > Hundredths::from_units(100)
                {
                    return Err("percent discount cannot exceed 100".into());
                }
                if discount.min_topup_minor < 0 {
                    return Err("min_topup_minor must not be negative".into());
                }
            }
        }
        Ok(())
    }
}

/// A promo code definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub max_total_uses: i64,
    pub max_uses_per_user: i64,
    /// Counts APPLIED redemptions only
    pub uses_count: i64,
    pub note: String,
    pub effect: Option<PromoEffect>,
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    /// Inclusive activity window; a missing bound is open
    pub fn is_in_window(&self, now: DateTime<Utc>) -> bool {
        let started = self.starts_at.map_or(true, |starts| starts <= now);
        let not_ended = self.ends_at.map_or(true, |ends| now <= ends);
        started && not_ended
    }

    /// Whether a user with `applied_by_user` APPLIED redemptions may redeem now.
    ///
    /// Pending, cancelled and expired redemptions never count toward the limits.
    pub fn check_redeemable(
        &self,
        applied_by_user: i64,
        now: DateTime<Utc>,
    ) -> Result<(), PromoReason> {
        if !self.is_active {
            return Err(PromoReason::PromoInactive);
        }
        if !self.is_in_window(now) {
            return Err(PromoReason::PromoExpiredOrNotStarted);
        }
        if self.uses_count >= self.max_total_uses {
            return Err(PromoReason::PromoLimitReached);
        }
        if applied_by_user >= self.max_uses_per_user {
            return Err(PromoReason::AlreadyRedeemed);
        }
        Ok(())
    }
}

/// Public view returned by validation
#[derive(Debug, Clone, Serialize)]
pub struct PromoView {
    pub code: String,
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub max_total_uses: i64,
    pub max_uses_per_user: i64,
    pub uses_count: i64,
    pub effect: Option<PromoEffect>,
}

impl From<PromoCode> for PromoView {
    fn from(promo: PromoCode) -> Self {
        Self {
            code: promo.code,
            is_active: promo.is_active,
            starts_at: promo.starts_at,
            ends_at: promo.ends_at,
            max_total_uses: promo.max_total_uses,
            max_uses_per_user: promo.max_uses_per_user,
            uses_count: promo.uses_count,
            effect: promo.effect,
        }
    }
}

/// Input for creating a promo code
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePromoInput {
    pub code: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default = "default_one")]
    pub max_total_uses: i64,
    #[serde(default = "default_one")]
    pub max_uses_per_user: i64,
    #[serde(default)]
    pub note: String,
    pub effect: Option<PromoEffect>,
}

fn default_true() -> bool {
    true
}

fn default_one() -> i64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    Pending,
    Applied,
    Cancelled,
    Expired,
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Applied => "applied",
            RedemptionStatus::Cancelled => "cancelled",
            RedemptionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for RedemptionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RedemptionStatus::Pending),
            "applied" => Ok(RedemptionStatus::Applied),
            "cancelled" => Ok(RedemptionStatus::Cancelled),
            "expired" => Ok(RedemptionStatus::Expired),
            _ => Err(anyhow::anyhow!("Invalid redemption status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionContext {
    Manual,
    Topup,
}

impl fmt::Display for RedemptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedemptionContext::Manual => write!(f, "manual"),
            RedemptionContext::Topup => write!(f, "topup"),
        }
    }
}

impl FromStr for RedemptionContext {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RedemptionContext::Manual),
            "topup" => Ok(RedemptionContext::Topup),
            _ => Err(anyhow::anyhow!("Invalid redemption context: {}", s)),
        }
    }
}

/// One use (or attempted use) of a promo code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoRedemption {
    pub id: i64,
    pub promo_id: i64,
    pub user_id: i64,
    pub status: RedemptionStatus,
    pub context: RedemptionContext,
    pub topup_amount_minor: Option<i64>,
    pub payment_id: String,
    pub topup_id: String,
    pub idempotency_key: Option<String>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub redeemed_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub ip: String,
    pub user_agent: String,
    pub payload: serde_json::Value,
}

impl PromoRedemption {
    /// A fresh redemption row (id assigned on insert)
    pub fn new(
        promo_id: i64,
        user_id: i64,
        status: RedemptionStatus,
        context: RedemptionContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            promo_id,
            user_id,
            status,
            context,
            topup_amount_minor: None,
            payment_id: String::new(),
            topup_id: String::new(),
            idempotency_key: None,
            reserved_until: None,
            redeemed_at: now,
            applied_at: if status == RedemptionStatus::Applied {
                Some(now)
            } else {
                None
            },
            ip: String::new(),
            user_agent: String::new(),
            payload: serde_json::json!({}),
        }
    }

    /// Attach client details, truncating the user agent
    pub fn with_client(mut self, ip: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip = ip.unwrap_or_default().to_string();
        self.user_agent = user_agent
            .unwrap_or_default()
            .chars()
            .take(USER_AGENT_MAX_LEN)
            .collect();
        self
    }

    /// A pending reservation that has not lapsed
    pub fn is_reservation_valid(&self, now: DateTime<Utc>) -> bool {
        if self.status != RedemptionStatus::Pending {
            return false;
        }
        self.reserved_until.map_or(true, |until| now < until)
    }

    /// A pending reservation whose deadline passed
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == RedemptionStatus::Pending
            && matches!(self.reserved_until, Some(until) if until < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn promo() -> PromoCode {
        PromoCode {
            id: 1,
            code: "WELCOME".into(),
            is_active: true,
            starts_at: None,
            ends_at: None,
            max_total_uses: 10,
            max_uses_per_user: 1,
            uses_count: 0,
            note: String::new(),
            effect: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_hundredths_parse_and_display() {
        assert_eq!("12.5".parse::<Hundredths>().unwrap(), Hundredths(1250));
        assert_eq!("7".parse::<Hundredths>().unwrap(), Hundredths(700));
        assert_eq!(".05".parse::<Hundredths>().unwrap(), Hundredths(5));
        assert_eq!("-1.10".parse::<Hundredths>().unwrap(), Hundredths(-110));
        assert!("1.234".parse::<Hundredths>().is_err());
        assert!("abc".parse::<Hundredths>().is_err());
        assert_eq!(Hundredths(1250).to_string(), "12.50");
        assert_eq!(Hundredths(-5).to_string(), "-0.05");
    }

    #[test]
    fn test_hundredths_json_forms() {
        let from_number: Hundredths = serde_json::from_str("10.25").unwrap();
        let from_int: Hundredths = serde_json::from_str("3").unwrap();
        let from_text: Hundredths = serde_json::from_str("\"0.50\"").unwrap();
        assert_eq!(from_number, Hundredths(1025));
        assert_eq!(from_int, Hundredths(300));
        assert_eq!(from_text, Hundredths(50));
        assert_eq!(serde_json::to_string(&Hundredths(300)).unwrap(), "\"3.00\"");
    }

    #[test]
    fn test_fixed_bonus_truncates() {
        let bonus = BalanceBonus {
            currency: Currency::Aki,
            bonus_type: BonusType::Fixed,
            bonus_value: Hundredths(1099),
            min_topup_minor: None,
        };
        assert_eq!(bonus.bonus_minor(None), Ok(10));
    }

    #[test]
    fn test_percent_bonus_requires_topup_and_minimum() {
        let bonus = BalanceBonus {
            currency: Currency::Aki,
            bonus_type: BonusType::Percent,
            bonus_value: Hundredths(1000),
            min_topup_minor: Some(500),
        };
        assert_eq!(bonus.bonus_minor(None), Err(PromoReason::TopupAmountRequired));
        assert_eq!(bonus.bonus_minor(Some(499)), Err(PromoReason::TopupTooSmall));
        assert_eq!(bonus.bonus_minor(Some(1999)), Ok(199));
    }

    #[test]
    fn test_discount_quote_caps_and_clamps() {
        let percent = TopupDiscount {
            currency: Currency::Rub,
            discount_type: DiscountType::Percent,
            discount_value: Hundredths(2500),
            min_topup_minor: 1000,
            max_discount_minor: Some(3000),
        };
        assert_eq!(percent.quote(999), Err(PromoReason::TopupTooSmall));
        let q = percent.quote(10_000).unwrap();
        assert_eq!((q.discount_minor, q.payable_minor), (2500, 7500));
        let q = percent.quote(100_000).unwrap();
        assert_eq!((q.discount_minor, q.payable_minor), (3000, 97_000));

        let fixed = TopupDiscount {
            currency: Currency::Rub,
            discount_type: DiscountType::Fixed,
            discount_value: Hundredths::from_units(500),
            min_topup_minor: 0,
            max_discount_minor: None,
        };
        let q = fixed.quote(200).unwrap();
        assert_eq!((q.discount_minor, q.payable_minor), (200, 0));
    }

    #[test]
    fn test_effect_json_is_tagged() {
        let effect = PromoEffect::ItemGrant(ItemGrant { item_id: 4 });
        let json = serde_json::to_value(&effect).unwrap();
        assert_eq!(json, serde_json::json!({"type": "item_grant", "item_id": 4}));

        let parsed: PromoEffect = serde_json::from_value(serde_json::json!({
            "type": "balance_bonus",
            "bonus_value": "50"
        }))
        .unwrap();
        match parsed {
            PromoEffect::BalanceBonus(b) => {
                assert_eq!(b.currency, Currency::Aki);
                assert_eq!(b.bonus_type, BonusType::Fixed);
                assert_eq!(b.bonus_value, Hundredths(5000));
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn test_effect_validation() {
        let over = PromoEffect::TopupDiscount(TopupDiscount {
            currency: Currency::Rub,
            discount_type: DiscountType::Percent,
            discount_value: Hundredths::from_units(150),
            min_topup_minor: 0,
            max_discount_minor: None,
        });
        assert!(over.validate().is_err());

        let zero_bonus = PromoEffect::BalanceBonus(BalanceBonus {
            currency: Currency::Aki,
            bonus_type: BonusType::Fixed,
            bonus_value: Hundredths(0),
            min_topup_minor: None,
        });
        assert!(zero_bonus.validate().is_err());
    }

    #[test]
    fn test_check_redeemable_order() {
        let now = Utc::now();
        let mut p = promo();
        assert_eq!(p.check_redeemable(0, now), Ok(()));
        assert_eq!(p.check_redeemable(1, now), Err(PromoReason::AlreadyRedeemed));

        p.uses_count = 10;
        assert_eq!(p.check_redeemable(1, now), Err(PromoReason::PromoLimitReached));

        p.ends_at = Some(now - Duration::seconds(1));
        assert_eq!(
            p.check_redeemable(0, now),
            Err(PromoReason::PromoExpiredOrNotStarted)
        );

        p.is_active = false;
        assert_eq!(p.check_redeemable(0, now), Err(PromoReason::PromoInactive));
    }

    #[test]
    fn test_window_is_inclusive() {
        let now = Utc::now();
        let mut p = promo();
        p.starts_at = Some(now);
        p.ends_at = Some(now);
        assert!(p.is_in_window(now));
        assert!(!p.is_in_window(now + Duration::milliseconds(1)));
    }

    #[test]
    fn test_reservation_validity() {
        let now = Utc::now();
        let mut r = PromoRedemption::new(1, 1, RedemptionStatus::Pending, RedemptionContext::Topup, now);
        assert!(r.is_reservation_valid(now));
        assert!(!r.is_stale(now));

        r.reserved_until = Some(now - Duration::minutes(1));
        assert!(!r.is_reservation_valid(now));
        assert!(r.is_stale(now));

        r.status = RedemptionStatus::Cancelled;
        assert!(!r.is_stale(now));
    }

    #[test]
    fn test_user_agent_truncated() {
        let ua = "x".repeat(400);
        let r = PromoRedemption::new(1, 1, RedemptionStatus::Applied, RedemptionContext::Manual, Utc::now())
            .with_client(Some("127.0.0.1"), Some(&ua));
        assert_eq!(r.user_agent.len(), USER_AGENT_MAX_LEN);
        assert!(r.applied_at.is_some());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(50))]

            #[test]
            fn discount_never_exceeds_topup(
                topup in 0i64..10_000_000,
                value in 0i64..10_000,
                cap in proptest::option::of(0i64..1_000_000),
                percent in any::<bool>(),
            ) {
                let discount = TopupDiscount {
                    currency: Currency::Rub,
                    discount_type: if percent { DiscountType::Percent } else { DiscountType::Fixed },
                    discount_value: Hundredths(value),
                    min_topup_minor: 0,
                    max_discount_minor: cap,
                };
                let q = discount.quote(topup).unwrap();
                prop_assert!(q.discount_minor >= 0);
                prop_assert!(q.discount_minor <= topup);
                prop_assert_eq!(q.discount_minor + q.payable_minor, topup);
                if let Some(cap) = cap {
                    prop_assert!(q.discount_minor <= cap);
                }
            }

            #[test]
            fn percent_bonus_is_monotonic(a in 0i64..1_000_000, b in 0i64..1_000_000, value in 1i64..20_000) {
                let bonus = BalanceBonus {
                    currency: Currency::Aki,
                    bonus_type: BonusType::Percent,
                    bonus_value: Hundredths(value),
                    min_topup_minor: None,
                };
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                prop_assert!(bonus.bonus_minor(Some(lo)).unwrap() <= bonus.bonus_minor(Some(hi)).unwrap());
            }

            #[test]
            fn hundredths_display_parses_back(v in -1_000_000_000i64..1_000_000_000) {
                let shown = Hundredths(v).to_string();
                prop_assert_eq!(shown.parse::<Hundredths>().unwrap(), Hundredths(v));
            }
        }
    }
}
