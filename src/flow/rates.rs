//! Pump rates from mixing ratios.
//!
//! A step names a precursor ratio `p` (precursor : second liquid), a
//! gas-to-liquid ratio `g` and a net flow `R`. The liquid share `R / (g + 1)`
//! is split `p : 1` between the two liquid pumps; the gas pump gets the rest.

use serde::Serialize;

use crate::hardware::PumpRole;
use crate::instruction::Step;

/// Rates for the three pumps in µL/min.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlowRates {
    /// Precursor pump.
    pub pump_1: f64,
    /// Second liquid pump.
    pub pump_2: f64,
    /// Gas pump.
    pub gas: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl FlowRates {
    /// Split `net_flow_rate` by the two ratios, rounded to 0.01 µL/min.
    pub fn from_ratios(precursor_ratio: f64, gas_liquid_ratio: f64, net_flow_rate: f64) -> Self {
        let liquid_share = (precursor_ratio + 1.0) * (gas_liquid_ratio + 1.0);
        Self {
            pump_1: round2(precursor_ratio * net_flow_rate / liquid_share),
            pump_2: round2(net_flow_rate / liquid_share),
            gas: round2(gas_liquid_ratio * net_flow_rate / (gas_liquid_ratio + 1.0)),
        }
    }

    /// Ratio-derived rates for a procedure step.
    pub fn for_procedure_step(step: &Step) -> Self {
        Self::from_ratios(
            step.precursor_ratio,
            step.gas_liquid_ratio,
            step.net_flow_rate,
        )
    }

    /// Explicit rates when the instruction gives all three, ratios otherwise.
    pub fn for_single_instruction(step: &Step) -> Self {
        match step.explicit_rates() {
            Some([pump_1, pump_2, gas]) => Self { pump_1, pump_2, gas },
            None => Self::for_procedure_step(step),
        }
    }

    /// Rate for one pump.
    pub fn for_pump(&self, role: PumpRole) -> f64 {
        match role {
            PumpRole::Pump1 => self.pump_1,
            PumpRole::Pump2 => self.pump_2,
            PumpRole::Gas => self.gas,
        }
    }

    /// Sum of the three rates.
    pub fn total(&self) -> f64 {
        self.pump_1 + self.pump_2 + self.gas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_reference_mixture() {
        let rates = FlowRates::from_ratios(3.0, 0.5, 12.5);
        assert_eq!(rates.pump_1, 6.25);
        assert_eq!(rates.pump_2, 2.08);
        assert_eq!(rates.gas, 4.17);
    }

    #[test]
    fn rates_sum_to_net_flow() {
        let rates = FlowRates::from_ratios(2.0, 0.2, 25.0);
        assert_eq!(rates.pump_1, 13.89);
        assert_eq!(rates.pump_2, 6.94);
        assert_eq!(rates.gas, 4.17);
        assert!((rates.total() - 25.0).abs() <= 0.01);
    }

    #[test]
    fn no_gas_means_all_liquid() {
        let rates = FlowRates::from_ratios(1.0, 0.0, 10.0);
        assert_eq!(rates.gas, 0.0);
        assert_eq!(rates.pump_1, 5.0);
        assert_eq!(rates.pump_2, 5.0);
    }

    #[test]
    fn explicit_rates_win_for_single_instructions() {
        let step = Step {
            precursor_ratio: 3.0,
            gas_liquid_ratio: 0.5,
            net_flow_rate: 12.5,
            pump_1_rate: Some(120.1),
            pump_2_rate: Some(60.0),
            pump_3_rate: Some(4.25),
            ..Step::default()
        };
        let rates = FlowRates::for_single_instruction(&step);
        assert_eq!((rates.pump_1, rates.pump_2, rates.gas), (120.1, 60.0, 4.25));
        assert_eq!(FlowRates::for_procedure_step(&step).pump_1, 6.25);
    }
}
