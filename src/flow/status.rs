//! Aggregated flow reactor status.

use serde::Serialize;

use crate::flow::executor::FlowExecutor;
use crate::reactor::Reactor;
use crate::run_state::RunSnapshot;

/// Run state plus device settings, serialized as one flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactorStatus {
    /// Run state and identity.
    #[serde(flatten)]
    pub run: RunSnapshot,
    /// Precursor pump rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_1_rate: Option<f64>,
    /// Second liquid pump rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_2_rate: Option<f64>,
    /// Gas pump rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_3_rate: Option<f64>,
    /// Temperature controller set point.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_set_point: Option<f64>,
    /// First light source output.
    pub light_source_1_on: bool,
    /// Second light source output.
    pub light_source_2_on: bool,
    /// Spectrometer integration time in µs.
    pub uv_spec_integration_time: u32,
    /// Spectrometer scans per read.
    pub uv_spec_scans_to_average: u32,
    /// Last stage coordinate reached.
    pub stage_position: Option<f64>,
    /// Viewing port of that coordinate.
    pub viewing_port: Option<u32>,
}

impl Reactor<FlowExecutor> {
    /// Status with live device readings.
    ///
    /// Devices are queried first, each under its own lock; a device that
    /// fails is left out. The run fields and the optics settings are then
    /// read together so they describe the same moment.
    pub async fn get_status(&self) -> ReactorStatus {
        let readback = self.executor().read_devices().await;
        let uuid = self.uuid();
        self.machine().with_state(|state| {
            let live = self.executor().live();
            let [pump_1_rate, pump_2_rate, pump_3_rate] = readback.pump_rates;
            ReactorStatus {
                run: RunSnapshot::new(uuid, state),
                pump_1_rate,
                pump_2_rate,
                pump_3_rate,
                temp_set_point: readback.temp_set_point,
                light_source_1_on: live.light_sources.light_source_1_on,
                light_source_2_on: live.light_sources.light_source_2_on,
                uv_spec_integration_time: live.integration_time_us,
                uv_spec_scans_to_average: live.scans_to_average,
                stage_position: live.stage_position,
                viewing_port: live.viewing_port,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::flow::{FlowReactor, FlowSettings};
    use crate::hardware::mock::MockDevices;
    use crate::reactor::ReactorIdentity;

    #[tokio::test]
    async fn idle_status_serializes_flat() {
        let mocks = MockDevices::new();
        let reactor = FlowReactor::flow(
            ReactorIdentity::new("reactor-1", "192.168.1.1"),
            mocks.devices(),
            FlowSettings::immediate(),
        );

        let status = reactor.get_status().await;
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["status"], "idle");
        assert_eq!(json["uuid"], "reactor-1");
        assert!(json["run_uuid"].is_null());
        assert_eq!(json["temp_set_point"], 25.0);
        assert_eq!(json["uv_spec_scans_to_average"], 10);
        assert!(json.get("steps_remaining").is_none());
        // Mock pumps report no rate until one is set.
        assert!(json.get("pump_1_rate").is_none());
    }

    #[tokio::test]
    async fn failing_device_is_omitted() {
        let mocks = MockDevices::new();
        mocks.temperature_controller.faults().set_failing(true);
        let reactor = FlowReactor::flow(
            ReactorIdentity::new("reactor-1", "192.168.1.1"),
            mocks.devices(),
            FlowSettings::immediate(),
        );

        let status = reactor.get_status().await;
        assert_eq!(status.temp_set_point, None);
        assert_eq!(status.run.uuid, "reactor-1");
    }
}
