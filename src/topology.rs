use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("channel {channel} out of range 1..={total}")]
    ChannelOutOfRange { channel: usize, total: usize },
    #[error("bank {bank} out of range 1..={banks}")]
    BankOutOfRange { bank: usize, banks: usize },
    #[error("pack shape must have at least one bank, sensor and battery")]
    EmptyShape,
}

/// Where a temperature channel sits in the pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLocation {
    pub channel: usize,
    pub battery: usize,
    pub bank: usize,
    pub local: usize,
}

/// Channel numbering for a pack of `parallel_batteries` identical
/// batteries, each made of `num_series_banks` banks carrying
/// `sensors_per_bank` sensors. Channels are 1-based and run battery by
/// battery, bank by bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    num_series_banks: usize,
    sensors_per_bank: usize,
    parallel_batteries: usize,
}

impl Topology {
    pub fn new(
        num_series_banks: usize,
        sensors_per_bank: usize,
        parallel_batteries: usize,
    ) -> Result<Self, TopologyError> {
        if num_series_banks == 0 || sensors_per_bank == 0 || parallel_batteries == 0 {
            return Err(TopologyError::EmptyShape);
        }
        Ok(Self {
            num_series_banks,
            sensors_per_bank,
            parallel_batteries,
        })
    }

    pub fn num_series_banks(&self) -> usize {
        self.num_series_banks
    }

    pub fn sensors_per_bank(&self) -> usize {
        self.sensors_per_bank
    }

    pub fn parallel_batteries(&self) -> usize {
        self.parallel_batteries
    }

    pub fn sensors_per_battery(&self) -> usize {
        self.num_series_banks * self.sensors_per_bank
    }

    pub fn total_channels(&self) -> usize {
        self.parallel_batteries * self.sensors_per_battery()
    }

    fn check_channel(&self, channel: usize) -> Result<usize, TopologyError> {
        let total = self.total_channels();
        if channel == 0 || channel > total {
            return Err(TopologyError::ChannelOutOfRange { channel, total });
        }
        Ok(channel - 1)
    }

    pub fn bank_of(&self, channel: usize) -> Result<usize, TopologyError> {
        let index = self.check_channel(channel)?;
        let within_battery = index % self.sensors_per_battery();
        Ok(within_battery / self.sensors_per_bank + 1)
    }

    /// Returns `(battery, local_channel)`, both 1-based.
    pub fn battery_and_local(&self, channel: usize) -> Result<(usize, usize), TopologyError> {
        let index = self.check_channel(channel)?;
        let per_battery = self.sensors_per_battery();
        Ok((index / per_battery + 1, index % per_battery + 1))
    }

    pub fn locate(&self, channel: usize) -> Result<ChannelLocation, TopologyError> {
        let bank = self.bank_of(channel)?;
        let (battery, local) = self.battery_and_local(channel)?;
        Ok(ChannelLocation {
            channel,
            battery,
            bank,
            local,
        })
    }

    /// All channels belonging to `bank` across every parallel battery,
    /// in ascending order.
    pub fn bank_channels(&self, bank: usize) -> Result<Vec<usize>, TopologyError> {
        if bank == 0 || bank > self.num_series_banks {
            return Err(TopologyError::BankOutOfRange {
                bank,
                banks: self.num_series_banks,
            });
        }
        let per_battery = self.sensors_per_battery();
        let offset = (bank - 1) * self.sensors_per_bank;
        Ok((0..self.parallel_batteries)
            .flat_map(|battery| {
                let base = battery * per_battery + offset;
                (base + 1)..=(base + self.sensors_per_bank)
            })
            .collect())
    }

    /// Channel range `[first, last]` served by one parallel battery (unit).
    pub fn battery_channels(&self, battery: usize) -> core::ops::RangeInclusive<usize> {
        let per_battery = self.sensors_per_battery();
        let first = (battery.saturating_sub(1)) * per_battery + 1;
        first..=(first + per_battery - 1)
    }
}
