//! Gas price and limit policy applied inside the nonce/gas critical section

/// Fee parameters of one submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeQuote {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl FeeQuote {
    /// Highest per-gas price this quote may pay
    pub fn max_price(&self) -> u128 {
        match self {
            FeeQuote::Legacy { gas_price } => *gas_price,
            FeeQuote::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// Per-chain gas configuration
#[derive(Debug, Clone, PartialEq)]
pub struct GasPolicy {
    /// Multiplier applied to the node's gas price (or priority fee)
    pub price_multiplier: f64,
    /// Multiplier applied to the gas estimate
    pub limit_multiplier: f64,
    pub min_gas_price: Option<u128>,
    pub max_gas_price: Option<u128>,
    pub max_gas_limit: Option<u64>,
    /// Ignore the base fee even when the chain exposes one
    pub legacy_only: bool,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            price_multiplier: 1.0,
            limit_multiplier: 1.2,
            min_gas_price: None,
            max_gas_price: None,
            max_gas_limit: None,
            legacy_only: false,
        }
    }
}

impl GasPolicy {
    /// Legacy quote from the node's suggested gas price
    pub fn legacy(&self, gas_price: u128) -> FeeQuote {
        FeeQuote::Legacy {
            gas_price: self.clamp_price(scale(gas_price, self.price_multiplier)),
        }
    }

    /// EIP-1559 quote: `fee_cap = 2 * base_fee + tip`
    pub fn eip1559(&self, base_fee: u128, priority_fee: u128) -> FeeQuote {
        let mut tip = scale(priority_fee, self.price_multiplier);
        let mut fee_cap = base_fee.saturating_mul(2).saturating_add(tip);
        if let Some(min) = self.min_gas_price {
            fee_cap = fee_cap.max(min);
        }
        if let Some(max) = self.max_gas_price {
            fee_cap = fee_cap.min(max);
        }
        tip = tip.min(fee_cap);
        FeeQuote::Eip1559 {
            max_fee_per_gas: fee_cap,
            max_priority_fee_per_gas: tip,
        }
    }

    /// Gas limit from the node's estimate
    pub fn gas_limit(&self, estimate: u64) -> u64 {
        let scaled = (estimate as f64 * self.limit_multiplier) as u64;
        match self.max_gas_limit {
            Some(max) => scaled.min(max),
            None => scaled,
        }
    }

    fn clamp_price(&self, price: u128) -> u128 {
        let mut price = price;
        if let Some(min) = self.min_gas_price {
            price = price.max(min);
        }
        if let Some(max) = self.max_gas_price {
            price = price.min(max);
        }
        price
    }
}

fn scale(value: u128, multiplier: f64) -> u128 {
    (value as f64 * multiplier) as u128
}
