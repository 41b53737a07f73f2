use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// External wallet / identity string that owns credit balances
pub type AccountId = String;

/// Reference returned by the external ledger for a landed debit
pub type TxReference = String;

/// Handle for credit held by `try_reserve` until it is committed or released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken(pub Uuid);

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement attempt state machine
///
/// Valid transitions:
/// - Initiated → Reserved, InsufficientCredit, WorkFailed
/// - Reserved → WorkDone, WorkFailed
/// - WorkDone → ExternalPending, ExternalFailed
/// - ExternalPending → Settled, ExternalFailed
/// - ExternalFailed → ReconcileQueued
/// - ReconcileQueued → Reconciled
/// - Settled, Reconciled, InsufficientCredit, WorkFailed → NO TRANSITIONS ALLOWED
///
/// `Initiated → WorkFailed` and `WorkDone → ExternalFailed` are only taken by
/// stale-attempt recovery, for attempts whose coordinator stopped mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Initiated,
    Reserved,
    WorkDone,
    ExternalPending,
    Settled,
    ExternalFailed,
    ReconcileQueued,
    Reconciled,
    InsufficientCredit,
    WorkFailed,
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Initiated => "initiated",
            SettlementState::Reserved => "reserved",
            SettlementState::WorkDone => "work_done",
            SettlementState::ExternalPending => "external_pending",
            SettlementState::Settled => "settled",
            SettlementState::ExternalFailed => "external_failed",
            SettlementState::ReconcileQueued => "reconcile_queued",
            SettlementState::Reconciled => "reconciled",
            SettlementState::InsufficientCredit => "insufficient_credit",
            SettlementState::WorkFailed => "work_failed",
        }
    }

    pub fn allowed_transitions(&self) -> &'static [SettlementState] {
        use SettlementState::*;
        match self {
            Initiated => &[Reserved, InsufficientCredit, WorkFailed],
            Reserved => &[WorkDone, WorkFailed],
            WorkDone => &[ExternalPending, ExternalFailed],
            ExternalPending => &[Settled, ExternalFailed],
            ExternalFailed => &[ReconcileQueued],
            ReconcileQueued => &[Reconciled],
            Settled | Reconciled | InsufficientCredit | WorkFailed => &[],
        }
    }

    pub fn can_transition_to(&self, to: SettlementState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// The external ledger has recorded the charge
    pub fn is_settled(&self) -> bool {
        matches!(self, SettlementState::Settled | SettlementState::Reconciled)
    }
}

/// Reservation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reservation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
}

/// Swaps credit locally in one step, so `Completed` is the only state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "swap_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SwapStatus {
    Completed,
}

/// Credit balance entity (per account, per provider)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditBalance {
    pub account_id: AccountId,
    pub provider: String,

    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub reserved_amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl CreditBalance {
    pub fn empty(account_id: &str, provider: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            provider: provider.to_string(),
            amount: Decimal::ZERO,
            reserved_amount: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Spendable credit: total minus outstanding reservations
    pub fn available(&self) -> Decimal {
        self.amount - self.reserved_amount
    }

    pub fn has_available(&self, required: Decimal) -> bool {
        self.available() >= required
    }

    /// Rough model-token figure shown to wallets (1 credit ~ 1M tokens)
    /// Saturates at `i64::MAX`.
    pub fn tokens_available(&self) -> i64 {
        self.available()
            .checked_mul(Decimal::from(1_000_000))
            .and_then(|tokens| tokens.floor().try_into().ok())
            .unwrap_or(i64::MAX)
    }
}

/// Immutable record of a token → credit exchange
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SwapRecord {
    pub swap_id: String,
    pub account_id: AccountId,
    pub asset: String,
    pub provider: String,

    #[serde(with = "rust_decimal::serde::float")]
    pub source_amount: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub credit_amount: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub rate: Decimal,
    pub status: SwapStatus,
    pub transaction_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Credit held against an in-flight settlement attempt
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub account_id: AccountId,
    pub provider: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn token(&self) -> ReservationToken {
        ReservationToken(self.id)
    }
}

/// One usage event. The id doubles as the external idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettlementAttempt {
    pub id: Uuid,
    pub account_id: AccountId,
    pub provider: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost: Decimal,
    pub state: SettlementState,
    pub reservation_id: Option<Uuid>,
    pub tx_reference: Option<TxReference>,
    pub work_summary: String,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementAttempt {
    pub fn new(account_id: &str, provider: &str, cost: Decimal, work_summary: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            provider: provider.to_string(),
            cost,
            state: SettlementState::Initiated,
            reservation_id: None,
            tx_reference: None,
            work_summary,
            last_error: None,
            retry_count: 0,
            next_retry_at: None,
            claimed_by: None,
            claim_expires_at: None,
            escalated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn idempotency_key(&self) -> String {
        self.id.to_string()
    }

    pub fn reservation_token(&self) -> Option<ReservationToken> {
        self.reservation_id.map(ReservationToken)
    }

    /// Lease is free if unclaimed or its expiry has passed
    pub fn is_lease_free(&self, now: DateTime<Utc>) -> bool {
        match (&self.claimed_by, self.claim_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires)) => expires < now,
            (Some(_), None) => false,
        }
    }

    pub fn is_reconcile_candidate(&self, now: DateTime<Utc>, max_retries: i32) -> bool {
        self.state == SettlementState::ReconcileQueued
            && self.escalated_at.is_none()
            && self.retry_count < max_retries
            && self.next_retry_at.map_or(true, |at| at <= now)
            && self.is_lease_free(now)
    }

    /// Left mid-flight: a non-terminal state the worker queue never sees,
    /// untouched since `cutoff`
    pub fn is_stranded(&self, cutoff: DateTime<Utc>) -> bool {
        STRANDED_STATES.contains(&self.state) && self.updated_at < cutoff
    }

    /// The reservation `try_reserve_as` makes for this attempt, linked or not
    pub fn own_reservation_token(&self) -> ReservationToken {
        ReservationToken(self.id)
    }
}

/// States a live coordinator moves through in one request
pub const STRANDED_STATES: [SettlementState; 5] = [
    SettlementState::Initiated,
    SettlementState::Reserved,
    SettlementState::WorkDone,
    SettlementState::ExternalPending,
    SettlementState::ExternalFailed,
];

/// Fields written alongside a state transition. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct AttemptPatch {
    pub reservation_id: Option<Uuid>,
    pub tx_reference: Option<TxReference>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Drop any worker lease on the row
    pub clear_claim: bool,
}

impl AttemptPatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reservation(token: ReservationToken) -> Self {
        Self {
            reservation_id: Some(token.0),
            ..Self::default()
        }
    }

    pub fn tx_reference(tx: TxReference) -> Self {
        Self {
            tx_reference: Some(tx),
            clear_claim: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Audit event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "audit_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SwapRecorded,
    CreditRejected,
    WorkFailed,
    AttemptSettled,
    AttemptQueued,
    AttemptReconciled,
    ReconciliationRetry,
    ReconciliationExhausted,
    AttemptRecovered,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLog {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub entity_id: Option<String>,
    pub account_id: Option<AccountId>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_settlement_state_transitions() {
        use SettlementState::*;

        assert!(Initiated.can_transition_to(Reserved));
        assert!(Initiated.can_transition_to(InsufficientCredit));
        assert!(!Initiated.can_transition_to(Settled));
        assert!(ExternalPending.can_transition_to(ExternalFailed));
        assert!(ReconcileQueued.can_transition_to(Reconciled));
        assert!(!ReconcileQueued.can_transition_to(Settled));
        assert!(Initiated.can_transition_to(WorkFailed));
        assert!(WorkDone.can_transition_to(ExternalFailed));
        assert!(!Reserved.can_transition_to(ExternalFailed));

        for terminal in [Settled, Reconciled, InsufficientCredit, WorkFailed] {
            assert!(terminal.is_terminal(), "{:?} must be terminal", terminal);
        }
        assert!(!ReconcileQueued.is_terminal());
    }

    #[test]
    fn test_balance_available_and_tokens() {
        let mut balance = CreditBalance::empty("0xabc", "openai");
        balance.amount = dec!(0.002);
        balance.reserved_amount = dec!(0.0005);

        assert_eq!(balance.available(), dec!(0.0015));
        assert!(balance.has_available(dec!(0.0015)));
        assert!(!balance.has_available(dec!(0.0016)));
        assert_eq!(balance.tokens_available(), 1500);
    }

    #[test]
    fn test_tokens_available_saturates_on_huge_balance() {
        let mut balance = CreditBalance::empty("0xabc", "openai");
        balance.amount = dec!(100_000_000_000_000_000_000_000);
        assert_eq!(balance.tokens_available(), i64::MAX);

        balance.amount = dec!(10_000_000_000_000);
        assert_eq!(balance.tokens_available(), i64::MAX);
    }

    #[test]
    fn test_stranded_attempts() {
        let now = Utc::now();
        let mut attempt = SettlementAttempt::new("0xabc", "openai", dec!(1), "m".to_string());
        attempt.updated_at = now - chrono::Duration::minutes(5);
        assert!(attempt.is_stranded(now));
        assert!(!attempt.is_stranded(now - chrono::Duration::minutes(10)));

        attempt.state = SettlementState::ReconcileQueued;
        assert!(!attempt.is_stranded(now));
        attempt.state = SettlementState::Settled;
        assert!(!attempt.is_stranded(now));
    }

    #[test]
    fn test_lease_and_candidate_checks() {
        let now = Utc::now();
        let mut attempt = SettlementAttempt::new("0xabc", "openai", dec!(1), "m".to_string());
        attempt.state = SettlementState::ReconcileQueued;
        attempt.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(attempt.is_reconcile_candidate(now, 3));

        attempt.claimed_by = Some("worker-a".to_string());
        attempt.claim_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!attempt.is_reconcile_candidate(now, 3));

        attempt.claim_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(attempt.is_reconcile_candidate(now, 3));

        attempt.retry_count = 3;
        assert!(!attempt.is_reconcile_candidate(now, 3));
    }
}
