//! Platform fee computation.
//!
//! The fee is a pure function of the configured basis-point schedule; it is
//! computed once at booking creation and bookkept inside the escrow amount.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Clone, Debug)]
pub struct PlatformFeeService {
    fee_bps: u32,
}

impl PlatformFeeService {
    pub fn new(fee_bps: u32) -> Self {
        Self { fee_bps }
    }

    /// Fee on a base rental amount, rounded to 2 decimal places.
    pub fn platform_fee(&self, base_amount: Decimal) -> Decimal {
        (base_amount * Decimal::from(self.fee_bps) / dec!(10_000)).round_dp(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_percent_of_ten_thousand_is_five_hundred() {
        let fees = PlatformFeeService::new(500);
        assert_eq!(fees.platform_fee(dec!(10_000)), dec!(500));
    }

    #[test]
    fn zero_schedule_charges_nothing() {
        let fees = PlatformFeeService::new(0);
        assert_eq!(fees.platform_fee(dec!(10_000)), dec!(0));
    }

    #[test]
    fn fee_rounds_to_cents() {
        let fees = PlatformFeeService::new(250);
        // 2.5% of 333.33 = 8.33325 -> 8.33
        assert_eq!(fees.platform_fee(dec!(333.33)), dec!(8.33));
    }
}
