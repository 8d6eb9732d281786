//! Coupons and their redemptions.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static COUPON_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z0-9]{4}-[A-Z0-9]{4}-[A-Z0-9]{4}$").expect("valid coupon code pattern")
});

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Check the `XXXX-XXXX-XXXX` coupon code shape.
pub fn is_valid_code(code: &str) -> bool {
    COUPON_CODE.is_match(code)
}

/// Generate a random coupon code.
pub fn generate_code() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut group = || -> String {
        (0..4)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    };
    let (a, b, c) = (group(), group(), group());
    format!("{}-{}-{}", a, b, c)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub amount: Decimal,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub num_uses: u32,
    pub num_redeemed: u32,
    /// Standard coupons are redeemable only by standard accounts, and the reverse.
    pub is_standard: bool,
    pub disabled: bool,
}

impl Coupon {
    pub fn is_exhausted(&self) -> bool {
        self.num_redeemed >= self.num_uses
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponRedemption {
    pub code: String,
    pub cloud_account_id: String,
    pub grant_id: Uuid,
    pub redeemed_at: DateTime<Utc>,
}

/// Input for creating a coupon.
#[derive(Debug, Clone)]
pub struct CreateCoupon {
    pub amount: Decimal,
    pub num_uses: u32,
    pub creator: String,
    pub start: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub is_standard: bool,
}

/// Result of the atomic redemption step in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed,
    AlreadyRedeemed,
    Exhausted,
    UnknownCoupon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_match_the_format() {
        for _ in 0..50 {
            let code = generate_code();
            assert!(is_valid_code(&code), "bad code {}", code);
        }
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(!is_valid_code("abcd-efgh-ijkl"));
        assert!(!is_valid_code("ABCD-EFGH"));
        assert!(!is_valid_code("ABCD-EFGH-IJKL-MNOP"));
        assert!(!is_valid_code("ABCDEFGHIJKL"));
        assert!(is_valid_code("AB12-CD34-EF56"));
    }
}
