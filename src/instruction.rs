//! Instructions accepted by the reactor and the steps they carry.
//!
//! Instructions arrive as JSON tagged by `kind`:
//!
//! ```json
//! {"kind": "procedure", "run_id": "aad9c46c-...", "steps": [{"temp_set_point": 90.0, ...}]}
//! {"kind": "single_instruction", "instruction": {"temp_set_point": 90.0, ...}}
//! {"kind": "stop"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ReactorError};

fn default_true() -> bool {
    true
}

fn default_integration_time() -> u32 {
    1000
}

fn default_scans_to_average() -> u32 {
    10
}

fn default_viewing_port() -> u32 {
    1
}

/// Set points for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Ratio of precursor to second liquid.
    #[serde(default)]
    pub precursor_ratio: f64,
    /// Ratio of gas to total liquid.
    #[serde(default)]
    pub gas_liquid_ratio: f64,
    /// Total flow in µL/min.
    #[serde(default)]
    pub net_flow_rate: f64,
    /// Coil temperature in °C.
    pub temp_set_point: f64,
    /// Take absorbance readings in procedure steps. Single instructions always read.
    #[serde(default = "default_true")]
    pub absorbance: bool,
    /// Take fluorescence readings (reserved).
    #[serde(default)]
    pub fluorescence: bool,
    /// Spectrometer integration time in µs.
    #[serde(default = "default_integration_time")]
    pub integration_time: u32,
    /// Scans averaged per reading.
    #[serde(default = "default_scans_to_average")]
    pub scans_to_average: u32,
    /// 1-based index into the configured stage positions (single instructions).
    #[serde(default = "default_viewing_port")]
    pub viewing_port: u32,
    /// Light source 1 state (single instructions).
    #[serde(default)]
    pub light_source_1_on: bool,
    /// Light source 2 state (single instructions).
    #[serde(default)]
    pub light_source_2_on: bool,
    /// Explicit precursor pump rate in µL/min.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_1_rate: Option<f64>,
    /// Explicit second pump rate in µL/min.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_2_rate: Option<f64>,
    /// Explicit gas pump rate in µL/min.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_3_rate: Option<f64>,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            precursor_ratio: 0.0,
            gas_liquid_ratio: 0.0,
            net_flow_rate: 0.0,
            temp_set_point: 25.0,
            absorbance: true,
            fluorescence: false,
            integration_time: default_integration_time(),
            scans_to_average: default_scans_to_average(),
            viewing_port: default_viewing_port(),
            light_source_1_on: false,
            light_source_2_on: false,
            pump_1_rate: None,
            pump_2_rate: None,
            pump_3_rate: None,
        }
    }
}

impl Step {
    /// Explicit pump rates, when all three are given.
    pub fn explicit_rates(&self) -> Option<[f64; 3]> {
        Some([self.pump_1_rate?, self.pump_2_rate?, self.pump_3_rate?])
    }

    /// Reject values no device could act on.
    pub fn validate(&self) -> AppResult<()> {
        let non_negative = [
            ("precursor_ratio", Some(self.precursor_ratio)),
            ("gas_liquid_ratio", Some(self.gas_liquid_ratio)),
            ("net_flow_rate", Some(self.net_flow_rate)),
            ("pump_1_rate", self.pump_1_rate),
            ("pump_2_rate", self.pump_2_rate),
            ("pump_3_rate", self.pump_3_rate),
        ];
        for (field, value) in non_negative {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(ReactorError::Validation(format!(
                        "{field} must be a finite, non-negative number (got {value})"
                    )));
                }
            }
        }
        if !self.temp_set_point.is_finite() {
            return Err(ReactorError::Validation(format!(
                "temp_set_point must be finite (got {})",
                self.temp_set_point
            )));
        }
        if self.integration_time == 0 {
            return Err(ReactorError::Validation(
                "integration_time must be positive".to_string(),
            ));
        }
        if self.scans_to_average == 0 {
            return Err(ReactorError::Validation(
                "scans_to_average must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A multi-step run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    /// Caller-assigned run id.
    #[serde(alias = "run_uuid")]
    pub run_id: String,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

/// Anything the reactor can be told to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    /// Apply one step's set points and take one reading.
    SingleInstruction {
        /// The step.
        instruction: Step,
    },
    /// Run a procedure step by step.
    Procedure(Procedure),
    /// Stop whatever is running.
    Stop,
}

impl Instruction {
    /// Parse an instruction; malformed input is a validation error.
    pub fn from_json(json: &str) -> AppResult<Self> {
        let instruction: Instruction = serde_json::from_str(json)
            .map_err(|e| ReactorError::Validation(format!("malformed instruction: {e}")))?;
        instruction.validate()?;
        Ok(instruction)
    }

    /// Check every step.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            Instruction::SingleInstruction { instruction } => instruction.validate(),
            Instruction::Procedure(procedure) => {
                if procedure.run_id.trim().is_empty() {
                    return Err(ReactorError::Validation(
                        "procedure run_id must not be empty".to_string(),
                    ));
                }
                if procedure.steps.is_empty() {
                    return Err(ReactorError::Validation(
                        "procedure contains no steps".to_string(),
                    ));
                }
                for (index, step) in procedure.steps.iter().enumerate() {
                    step.validate().map_err(|e| match e {
                        ReactorError::Validation(msg) => {
                            ReactorError::Validation(format!("step {}: {msg}", index + 1))
                        }
                        other => other,
                    })?;
                }
                Ok(())
            }
            Instruction::Stop => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_procedure_with_defaults() {
        let json = r#"{
            "kind": "procedure",
            "run_id": "aad9c46c-34db-4d9e-91c6-2fdc1af07c69",
            "steps": [
                {"precursor_ratio": 3, "gas_liquid_ratio": 0.5, "net_flow_rate": 12.5, "temp_set_point": 90},
                {"precursor_ratio": 1, "gas_liquid_ratio": 0.5, "net_flow_rate": 10, "temp_set_point": 100,
                 "integration_time": 3000}
            ]
        }"#;
        let Instruction::Procedure(procedure) = Instruction::from_json(json).unwrap() else {
            panic!("expected a procedure");
        };
        assert_eq!(procedure.steps.len(), 2);
        assert!(procedure.steps[0].absorbance);
        assert_eq!(procedure.steps[0].scans_to_average, 10);
        assert_eq!(procedure.steps[1].integration_time, 3000);
    }

    #[test]
    fn accepts_legacy_run_uuid_key() {
        let json = r#"{"kind": "procedure", "run_uuid": "abc", "steps": [{"temp_set_point": 50}]}"#;
        let Instruction::Procedure(procedure) = Instruction::from_json(json).unwrap() else {
            panic!("expected a procedure");
        };
        assert_eq!(procedure.run_id, "abc");
    }

    #[test]
    fn single_instruction_with_explicit_rates() {
        let json = r#"{"kind": "single_instruction", "instruction": {
            "pump_1_rate": 120.1, "pump_2_rate": 60, "pump_3_rate": 4.25,
            "temp_set_point": 90, "light_source_1_on": true, "integration_time": 3000,
            "scans_to_average": 12, "viewing_port": 2}}"#;
        let Instruction::SingleInstruction { instruction } = Instruction::from_json(json).unwrap()
        else {
            panic!("expected a single instruction");
        };
        assert_eq!(instruction.explicit_rates(), Some([120.1, 60.0, 4.25]));
        assert_eq!(instruction.viewing_port, 2);
    }

    #[test]
    fn stop_has_no_payload() {
        assert_eq!(Instruction::from_json(r#"{"kind": "stop"}"#).unwrap(), Instruction::Stop);
    }

    #[test]
    fn fractional_scan_count_is_malformed() {
        let json = r#"{"kind": "single_instruction", "instruction": {"temp_set_point": 90, "scans_to_average": 2.5}}"#;
        assert!(matches!(
            Instruction::from_json(json),
            Err(ReactorError::Validation(_))
        ));
    }

    #[test]
    fn negative_ratio_is_rejected() {
        let instruction = Instruction::SingleInstruction {
            instruction: Step {
                precursor_ratio: -1.0,
                ..Step::default()
            },
        };
        assert!(matches!(
            instruction.validate(),
            Err(ReactorError::Validation(_))
        ));
    }

    #[test]
    fn empty_procedure_is_rejected() {
        let instruction = Instruction::Procedure(Procedure {
            run_id: "run".into(),
            steps: vec![],
        });
        assert!(instruction.validate().is_err());
    }

    #[test]
    fn unknown_kind_is_malformed() {
        assert!(matches!(
            Instruction::from_json(r#"{"kind": "dance"}"#),
            Err(ReactorError::Validation(_))
        ));
    }
}
