//! Core ledger models
//!
//! Wallets, money tokens, and history records: the three independently
//! persisted aggregates the orchestrator moves funds across.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Money-token lifetime: redeemable for 48 hours after creation.
pub const TOKEN_TTL_HOURS: i64 = 48;

/// Length of a money-token code (four blocks of four digits).
pub const TOKEN_CODE_LEN: usize = 16;

// ============================================================
// TRANSFER METHOD
// ============================================================

/// How a transfer entered the ledger.
///
/// IDs are designed for SMALLINT storage in the backing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TransferMethod {
    /// Payee-generated QR: the scanner pays the token's creator
    PaymentQrCode = 1,
    /// Payer-generated QR: the scanner receives the token's amount
    TransactionQrCode = 2,
    /// Direct wallet-to-wallet transfer addressed by OnePay ID
    OnePayId = 3,
    /// Funds entering from a linked external account
    Recharge = 4,
    /// Funds leaving to a linked external account
    Withdraw = 5,
}

impl TransferMethod {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(TransferMethod::PaymentQrCode),
            2 => Some(TransferMethod::TransactionQrCode),
            3 => Some(TransferMethod::OnePayId),
            4 => Some(TransferMethod::Recharge),
            5 => Some(TransferMethod::Withdraw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMethod::PaymentQrCode => "PAYMENT_QR_CODE",
            TransferMethod::TransactionQrCode => "TRANSACTION_QR_CODE",
            TransferMethod::OnePayId => "ONEPAY_ID",
            TransferMethod::Recharge => "RECHARGE",
            TransferMethod::Withdraw => "WITHDRAW",
        }
    }

    /// Only QR methods may be carried by a money token.
    #[inline]
    pub fn is_token_method(&self) -> bool {
        matches!(
            self,
            TransferMethod::PaymentQrCode | TransferMethod::TransactionQrCode
        )
    }
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================
// WALLET
// ============================================================

/// One wallet per user. `amount` is in minor units and never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: u64,
    pub amount: u64,
    /// False whenever a credit landed that the owner has not viewed.
    pub seen: bool,
}

impl Wallet {
    pub fn new(user_id: u64, amount: u64) -> Self {
        Self {
            user_id,
            amount,
            seen: true,
        }
    }
}

// ============================================================
// MONEY TOKEN
// ============================================================

/// A single-use, time-limited claim check redeemable for a fixed amount.
///
/// Created by a sending operation, consumed (deleted) exactly once by a
/// receiving/paying operation. Delete-then-use ordering enforces the
/// single-redemption invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyToken {
    /// 16-digit code; no 4-digit block is all-identical digits
    pub code: String,
    pub amount: u64,
    pub method: TransferMethod,
    pub sender_id: u64,
    pub sent_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MoneyToken {
    /// Create a token with a fresh code, expiring [`TOKEN_TTL_HOURS`] from now.
    pub fn new(amount: u64, method: TransferMethod, sender_id: u64) -> Self {
        debug_assert!(method.is_token_method());
        let sent_at = Utc::now();
        Self {
            code: generate_token_code(&mut rand::thread_rng()),
            amount,
            method,
            sender_id,
            sent_at,
            expires_at: sent_at + Duration::hours(TOKEN_TTL_HOURS),
        }
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Display for MoneyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token[{}] {} amount={} sender={} expires={}",
            self.code, self.method, self.amount, self.sender_id, self.expires_at
        )
    }
}

/// Generate a 16-digit token code as four 4-digit blocks.
///
/// A block of four identical digits is rerolled, so a code can never
/// contain a block like `0000` or `7777`.
pub fn generate_token_code<R: Rng>(rng: &mut R) -> String {
    let mut code = String::with_capacity(TOKEN_CODE_LEN);
    for _ in 0..4 {
        loop {
            let block: [u8; 4] = [
                rng.gen_range(0..10),
                rng.gen_range(0..10),
                rng.gen_range(0..10),
                rng.gen_range(0..10),
            ];
            if block.iter().any(|d| *d != block[0]) {
                for d in block {
                    code.push(char::from(b'0' + d));
                }
                break;
            }
        }
    }
    code
}

/// Check the shape constraint on a token code.
pub fn is_valid_token_code(code: &str) -> bool {
    if code.len() != TOKEN_CODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    code.as_bytes()
        .chunks(4)
        .all(|block| block.iter().any(|d| *d != block[0]))
}

// ============================================================
// HISTORY
// ============================================================

/// Durable proof that a transfer completed. Append-only; only the seen
/// flags are ever mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Assigned by the history store
    pub id: u64,
    pub sender_id: u64,
    pub receiver_id: u64,
    pub method: TransferMethod,
    pub code: Option<String>,
    pub amount: u64,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub sender_seen: bool,
    pub receiver_seen: bool,
}

/// A history record before the store has assigned its id.
///
/// Also the checkpoint before-image for the history stream, so equality
/// must be a full value match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDraft {
    pub sender_id: u64,
    pub receiver_id: u64,
    pub method: TransferMethod,
    pub code: Option<String>,
    pub amount: u64,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl HistoryDraft {
    pub fn new(
        sender_id: u64,
        receiver_id: u64,
        method: TransferMethod,
        code: Option<String>,
        amount: u64,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            method,
            code,
            amount,
            sent_at,
            received_at: Utc::now(),
        }
    }

    /// Materialize into a full record once the store assigns an id.
    pub fn into_record(self, id: u64) -> HistoryRecord {
        HistoryRecord {
            id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            method: self.method,
            code: self.code,
            amount: self.amount,
            sent_at: self.sent_at,
            received_at: self.received_at,
            sender_seen: false,
            receiver_seen: false,
        }
    }
}

impl fmt::Display for HistoryDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "History {} -> {} method={} amount={}",
            self.sender_id, self.receiver_id, self.method, self.amount
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_method_roundtrip() {
        for id in 1..=5 {
            let m = TransferMethod::from_id(id).unwrap();
            assert_eq!(m.id(), id);
        }
        assert_eq!(TransferMethod::from_id(0), None);
        assert_eq!(TransferMethod::from_id(6), None);
    }

    #[test]
    fn test_token_methods() {
        assert!(TransferMethod::PaymentQrCode.is_token_method());
        assert!(TransferMethod::TransactionQrCode.is_token_method());
        assert!(!TransferMethod::OnePayId.is_token_method());
        assert!(!TransferMethod::Recharge.is_token_method());
    }

    #[test]
    fn test_generated_codes_are_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let code = generate_token_code(&mut rng);
            assert!(is_valid_token_code(&code), "bad code: {}", code);
        }
    }

    #[test]
    fn test_code_validation_rejects_identical_block() {
        assert!(is_valid_token_code("1234567890123456"));
        // Third block is all-identical
        assert!(!is_valid_token_code("1234567800001234"));
        assert!(!is_valid_token_code("123456789012345")); // too short
        assert!(!is_valid_token_code("123456789012345a")); // non-digit
    }

    #[test]
    fn test_token_expiry() {
        let token = MoneyToken::new(500, TransferMethod::TransactionQrCode, 1);
        assert!(!token.is_expired(Utc::now()));
        assert!(token.is_expired(token.sent_at + Duration::hours(TOKEN_TTL_HOURS)));
        assert_eq!(
            token.expires_at - token.sent_at,
            Duration::hours(TOKEN_TTL_HOURS)
        );
    }

    #[test]
    fn test_draft_into_record() {
        let draft = HistoryDraft::new(1, 2, TransferMethod::OnePayId, None, 5000, Utc::now());
        let record = draft.clone().into_record(42);
        assert_eq!(record.id, 42);
        assert_eq!(record.amount, 5000);
        assert!(!record.sender_seen);
        assert!(!record.receiver_seen);
    }
}
