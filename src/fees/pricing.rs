//! Price tables and exact fee arithmetic.
//!
//! Prices are held in nano-USD per 1,000 tokens, the dev fee in basis
//! points and the exchange rate in micro-USD per native unit, so the whole
//! computation is integer and the final ceiling is exact.

use crate::fees::FeeError;

/// Per-1k-token prices in nano-USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPrice {
    pub input: u64,
    pub output: u64,
}

const OPENAI_PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", ModelPrice { input: 150_000, output: 600_000 }),
    ("gpt-4o", ModelPrice { input: 2_500_000, output: 10_000_000 }),
    ("gpt-4-turbo", ModelPrice { input: 10_000_000, output: 30_000_000 }),
    ("gpt-3.5-turbo", ModelPrice { input: 500_000, output: 1_500_000 }),
];

/// Price for `model`: exact name first, then the longest known prefix so
/// dated snapshots such as `gpt-4o-2024-08-06` price like their family.
pub fn openai_price(model: &str) -> Result<ModelPrice, FeeError> {
    if let Some((_, price)) = OPENAI_PRICES.iter().find(|(name, _)| *name == model) {
        return Ok(*price);
    }
    OPENAI_PRICES
        .iter()
        .filter(|(name, _)| model.starts_with(&format!("{name}-")))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, price)| *price)
        .ok_or_else(|| FeeError::UnknownModel(model.to_string()))
}

/// Dev-fee markup and exchange rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    dev_fee_bps: u64,
    micro_usd_per_native: u64,
}

impl FeePolicy {
    pub fn new(dev_fee_percent: f64, usd_per_native: f64) -> Result<Self, FeeError> {
        if !dev_fee_percent.is_finite() || dev_fee_percent < 0.0 {
            return Err(FeeError::InvalidPolicy(format!(
                "dev fee percent must be >= 0, got {dev_fee_percent}"
            )));
        }
        // Markup rounds up and the rate rounds down so the fee never shrinks.
        let rate = to_units(usd_per_native * 1e6, f64::floor);
        if !rate.is_finite() || rate < 1.0 {
            return Err(FeeError::InvalidPolicy(format!(
                "exchange rate must be > 0, got {usd_per_native}"
            )));
        }
        Ok(Self {
            dev_fee_bps: to_units(dev_fee_percent * 100.0, f64::ceil) as u64,
            micro_usd_per_native: rate as u64,
        })
    }

    pub fn dev_fee_bps(&self) -> u64 {
        self.dev_fee_bps
    }

    pub fn micro_usd_per_native(&self) -> u64 {
        self.micro_usd_per_native
    }

    /// `ceil(usd * (1 + fee) / rate * 1e9)` for the given token counts.
    pub fn fee_for_tokens(
        &self,
        price: ModelPrice,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<u64, FeeError> {
        // Sum of tokens * nano-USD-per-1k, i.e. 1e12 x USD.
        let scaled_usd = u128::from(prompt_tokens) * u128::from(price.input)
            + u128::from(completion_tokens) * u128::from(price.output);

        // minor = scaled_usd / 1e12 * (1 + bps / 1e4) / (rate / 1e6) * 1e9
        let numerator = scaled_usd
            .checked_mul(10_000 + u128::from(self.dev_fee_bps))
            .ok_or(FeeError::Overflow)?;
        let denominator = 10 * u128::from(self.micro_usd_per_native);

        u64::try_from(numerator.div_ceil(denominator)).map_err(|_| FeeError::Overflow)
    }
}

/// Snap binary-float noise (e.g. `0.07 * 100.0 = 7.000000000000001`) to the
/// whole unit; anything further off is rounded with `direction`.
fn to_units(value: f64, direction: fn(f64) -> f64) -> f64 {
    let nearest = value.round();
    if (value - nearest).abs() <= 1e-9 * nearest.abs().max(1.0) {
        nearest
    } else {
        direction(value)
    }
}
