//! Ledger configuration with validation.
//!
//! Configuration can come from programmatic defaults, a deserialized file
//! (TOML/JSON via serde), or environment variables prefixed `VELEDGER_`.
//! `validate()` runs the same checks the typed constructors run, so an
//! invalid file fails at load time rather than at first use.

use serde::{Deserialize, Serialize};

use crate::epoch::{EpochClock, DEFAULT_EPOCH_SECS};
use crate::types::{Bps, LedgerParams, RuntimeBounds, BPS_U16};
use crate::{LedgerError, Result};

/// Complete ledger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Epoch timing.
    pub epoch: EpochConfig,

    /// Economic policy parameters.
    pub policy: PolicyConfig,

    /// Runtime safety bounds.
    pub bounds: RuntimeBounds,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochConfig {
    /// Epoch length in seconds.
    pub epoch_secs: u64,
}

impl Default for EpochConfig {
    fn default() -> Self {
        EpochConfig {
            epoch_secs: DEFAULT_EPOCH_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub min_lock_epochs: u64,
    pub max_lock_epochs: u64,
    pub fee_raise_delay_epochs: u64,
    pub sweep_delay_epochs: u64,
    pub max_fee_bps: u16,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            min_lock_epochs: 1,
            // 52 epochs of 14 days = 728 days, the maximum lock span.
            max_lock_epochs: 52,
            fee_raise_delay_epochs: 1,
            sweep_delay_epochs: 2,
            max_fee_bps: BPS_U16,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            epoch: EpochConfig::default(),
            policy: PolicyConfig::default(),
            bounds: RuntimeBounds::default(),
        }
    }
}

impl LedgerConfig {
    pub fn builder() -> LedgerConfigBuilder {
        LedgerConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Recognized variables:
    /// - `VELEDGER_EPOCH_SECS`
    /// - `VELEDGER_MAX_LOCK_EPOCHS`
    /// - `VELEDGER_SWEEP_DELAY_EPOCHS`
    /// - `VELEDGER_MAX_FEE_BPS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("VELEDGER_EPOCH_SECS") {
            config.epoch.epoch_secs = v
                .parse()
                .map_err(|e| LedgerError::InvalidInput(format!("VELEDGER_EPOCH_SECS: {e}")))?;
        }
        if let Ok(v) = std::env::var("VELEDGER_MAX_LOCK_EPOCHS") {
            config.policy.max_lock_epochs = v.parse().map_err(|e| {
                LedgerError::InvalidInput(format!("VELEDGER_MAX_LOCK_EPOCHS: {e}"))
            })?;
        }
        if let Ok(v) = std::env::var("VELEDGER_SWEEP_DELAY_EPOCHS") {
            config.policy.sweep_delay_epochs = v.parse().map_err(|e| {
                LedgerError::InvalidInput(format!("VELEDGER_SWEEP_DELAY_EPOCHS: {e}"))
            })?;
        }
        if let Ok(v) = std::env::var("VELEDGER_MAX_FEE_BPS") {
            config.policy.max_fee_bps = v
                .parse()
                .map_err(|e| LedgerError::InvalidInput(format!("VELEDGER_MAX_FEE_BPS: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        self.clock()?;
        self.params()?;
        self.bounds.validate()?;
        Ok(())
    }

    pub fn clock(&self) -> Result<EpochClock> {
        EpochClock::new(self.epoch.epoch_secs)
    }

    pub fn params(&self) -> Result<LedgerParams> {
        LedgerParams::new(
            self.policy.min_lock_epochs,
            self.policy.max_lock_epochs,
            self.policy.fee_raise_delay_epochs,
            self.policy.sweep_delay_epochs,
            Bps::new(self.policy.max_fee_bps)?,
        )
    }
}

/// Builder for [`LedgerConfig`].
#[derive(Debug, Default)]
pub struct LedgerConfigBuilder {
    config: LedgerConfig,
}

impl LedgerConfigBuilder {
    pub fn epoch_secs(mut self, secs: u64) -> Self {
        self.config.epoch.epoch_secs = secs;
        self
    }

    pub fn min_lock_epochs(mut self, epochs: u64) -> Self {
        self.config.policy.min_lock_epochs = epochs;
        self
    }

    pub fn max_lock_epochs(mut self, epochs: u64) -> Self {
        self.config.policy.max_lock_epochs = epochs;
        self
    }

    pub fn fee_raise_delay_epochs(mut self, epochs: u64) -> Self {
        self.config.policy.fee_raise_delay_epochs = epochs;
        self
    }

    pub fn sweep_delay_epochs(mut self, epochs: u64) -> Self {
        self.config.policy.sweep_delay_epochs = epochs;
        self
    }

    pub fn max_fee_bps(mut self, bps: u16) -> Self {
        self.config.policy.max_fee_bps = bps;
        self
    }

    pub fn bounds(mut self, bounds: RuntimeBounds) -> Self {
        self.config.bounds = bounds;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<LedgerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let c = LedgerConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.clock().unwrap().epoch_secs(), DEFAULT_EPOCH_SECS);
        assert_eq!(c.params().unwrap().max_lock_epochs(), 52);
    }

    #[test]
    fn builder_validates_on_build() {
        assert!(LedgerConfig::builder().epoch_secs(0).build().is_err());
        assert!(LedgerConfig::builder().max_fee_bps(10_001).build().is_err());
        assert!(LedgerConfig::builder()
            .min_lock_epochs(4)
            .max_lock_epochs(2)
            .build()
            .is_err());

        let c = LedgerConfig::builder()
            .epoch_secs(3_600)
            .max_lock_epochs(10)
            .sweep_delay_epochs(1)
            .max_fee_bps(2_000)
            .build()
            .unwrap();
        assert_eq!(c.epoch.epoch_secs, 3_600);
        assert_eq!(c.params().unwrap().sweep_delay_epochs(), 1);
    }
}
