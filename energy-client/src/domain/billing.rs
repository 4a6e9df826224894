use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" => Ok(Self::Yearly),
            other => Err(format!("unknown billing period '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillSetting {
    pub device_id: String,
    pub total_bill_amount: f64,
    pub billing_period: BillingPeriod,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Latest cumulative energy of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelEnergy {
    pub channel_number: i32,
    pub energy_wh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelShare {
    pub channel_number: i32,
    pub energy_wh: f64,
    pub consumption_kwh: f64,
    pub percentage: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillSplit {
    pub total_bill: f64,
    pub total_energy_wh: f64,
    pub shares: Vec<ChannelShare>,
}

impl BillSplit {
    pub fn share(&self, channel_number: i32) -> Option<&ChannelShare> {
        self.shares.iter().find(|s| s.channel_number == channel_number)
    }
}

/// Fraction of the device total consumed by one channel; 0 when nothing was consumed.
pub fn energy_fraction(channel_energy_wh: f64, total_energy_wh: f64) -> f64 {
    if total_energy_wh > 0.0 {
        channel_energy_wh / total_energy_wh
    } else {
        0.0
    }
}

pub fn proportional_cost(channel_energy_wh: f64, total_energy_wh: f64, total_bill: f64) -> f64 {
    energy_fraction(channel_energy_wh, total_energy_wh) * total_bill
}

/// Split `total_bill` across channels in proportion to their energy.
///
/// Pure: the same inputs always yield the same split. Negative energies are
/// treated as zero so a misbehaving counter cannot produce negative charges.
pub fn split_bill(total_bill: f64, energies: &[ChannelEnergy]) -> BillSplit {
    let clamp = |e: f64| if e.is_finite() { e.max(0.0) } else { 0.0 };
    let total_energy_wh: f64 = energies.iter().map(|e| clamp(e.energy_wh)).sum();

    let shares = energies
        .iter()
        .map(|e| {
            let energy_wh = clamp(e.energy_wh);
            let fraction = energy_fraction(energy_wh, total_energy_wh);
            ChannelShare {
                channel_number: e.channel_number,
                energy_wh,
                consumption_kwh: energy_wh / 1000.0,
                percentage: fraction * 100.0,
                cost: fraction * total_bill,
            }
        })
        .collect();

    BillSplit {
        total_bill,
        total_energy_wh,
        shares,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energies(values: &[f64]) -> Vec<ChannelEnergy> {
        values
            .iter()
            .enumerate()
            .map(|(i, &energy_wh)| ChannelEnergy {
                channel_number: i as i32 + 1,
                energy_wh,
            })
            .collect()
    }

    #[test]
    fn equal_consumption_splits_evenly() {
        let split = split_bill(4000.0, &energies(&[100.0, 100.0, 100.0, 100.0]));
        for share in &split.shares {
            assert!((share.cost - 1000.0).abs() < 1e-9);
            assert!((share.percentage - 25.0).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_consumption_charges_nothing() {
        let split = split_bill(500.0, &energies(&[0.0, 0.0]));
        assert_eq!(split.total_energy_wh, 0.0);
        assert!(split.shares.iter().all(|s| s.cost == 0.0 && s.percentage == 0.0));
    }

    #[test]
    fn costs_sum_to_bill_when_anything_was_consumed() {
        let inputs = [
            vec![1.0, 2.0, 3.0, 4.0],
            vec![0.0, 0.0, 12.5, 0.0],
            vec![1234.5, 0.001, 99.9, 7.0, 42.0, 3.3, 0.0, 8.0],
        ];
        for values in inputs {
            let split = split_bill(3721.37, &energies(&values));
            let sum: f64 = split.shares.iter().map(|s| s.cost).sum();
            assert!((sum - 3721.37).abs() < 1e-6, "sum {sum} for {values:?}");
        }
    }

    #[test]
    fn consumption_is_reported_in_kwh() {
        let split = split_bill(0.0, &energies(&[2500.0]));
        assert_eq!(split.share(1).map(|s| s.consumption_kwh), Some(2.5));
    }

    #[test]
    fn negative_counters_do_not_produce_negative_costs() {
        let split = split_bill(100.0, &energies(&[-50.0, 50.0]));
        assert_eq!(split.share(1).map(|s| s.cost), Some(0.0));
        assert_eq!(split.share(2).map(|s| s.cost), Some(100.0));
    }

    #[test]
    fn proportional_cost_guards_division_by_zero() {
        assert_eq!(proportional_cost(10.0, 0.0, 500.0), 0.0);
        assert_eq!(proportional_cost(25.0, 100.0, 400.0), 100.0);
    }

    #[test]
    fn billing_period_parses_its_own_rendering() {
        for p in [
            BillingPeriod::Weekly,
            BillingPeriod::Monthly,
            BillingPeriod::Quarterly,
            BillingPeriod::Yearly,
        ] {
            assert_eq!(p.as_str().parse::<BillingPeriod>(), Ok(p));
        }
        assert!("fortnightly".parse::<BillingPeriod>().is_err());
    }
}
