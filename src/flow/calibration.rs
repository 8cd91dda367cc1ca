//! Blank/dark calibration and stage position loading.
//!
//! Spectrum CSVs have a `wavelength,intensity` header. A file written by
//! [`store_blank`](crate::flow::FlowReactor::store_blank) holds one block of
//! rows per reading; reading it back averages the blocks.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::error::{AppResult, ReactorError};
use crate::flow::executor::FlowExecutor;
use crate::hardware::{FlowRate, Spectrum};
use crate::reactor::Reactor;
use crate::run_state::{CommandAck, RunStatus, PROCEDURE_ALREADY_RUNNING};
use crate::settle;

#[derive(Debug, Serialize, Deserialize)]
struct SpectrumRow {
    wavelength: f64,
    intensity: f64,
}

#[derive(Debug, Deserialize)]
struct StagePositionRow {
    stage_positions: f64,
}

/// Read a spectrum CSV, averaging repeated readings.
///
/// A new reading starts whenever the wavelength stops increasing. Readings
/// whose length differs from the first are ignored.
pub fn read_spectrum_csv(path: &Path) -> AppResult<Spectrum> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut readings: Vec<Spectrum> = Vec::new();
    for row in reader.deserialize() {
        let row: SpectrumRow = row?;
        let starts_reading = match readings.last().and_then(|r| r.wavelengths.last()) {
            Some(&previous) => row.wavelength <= previous,
            None => true,
        };
        if starts_reading {
            readings.push(Spectrum {
                wavelengths: Vec::new(),
                values: Vec::new(),
            });
        }
        if let Some(reading) = readings.last_mut() {
            reading.wavelengths.push(row.wavelength);
            reading.values.push(row.intensity);
        }
    }

    let mut readings = readings.into_iter();
    let Some(mut mean) = readings.next() else {
        return Err(ReactorError::Validation(format!(
            "{} contains no spectrum rows",
            path.display()
        )));
    };
    let mut count = 1.0;
    for reading in readings {
        if reading.len() != mean.len() {
            warn!(path = %path.display(), "Ignoring reading of different length");
            continue;
        }
        for (sum, value) in mean.values.iter_mut().zip(&reading.values) {
            *sum += value;
        }
        count += 1.0;
    }
    for value in &mut mean.values {
        *value /= count;
    }
    Ok(mean)
}

/// Read the `stage_positions` column of a CSV.
pub fn read_stage_positions_csv(path: &Path) -> AppResult<Vec<f64>> {
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .deserialize()
        .map(|row| {
            let row: StagePositionRow = row?;
            Ok(row.stage_positions)
        })
        .collect()
}

impl FlowExecutor {
    /// Append raw readings to the blank CSV until `duration` has passed.
    /// At least one reading is taken. Returns the number of readings.
    async fn record_raw_readings(&self, duration: Duration) -> AppResult<usize> {
        let calibration = &self.settings().calibration;
        let path = &calibration.blank_output;
        let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);

        let session = self
            .devices()
            .spectrometer()
            .await
            .map_err(|e| ReactorError::device("spectrometer", e))?;
        let started = Instant::now();
        let mut readings = 0;
        loop {
            let spectrum = session
                .raw_read(calibration.integration_time_us)
                .await
                .map_err(|e| ReactorError::device("spectrometer", e))?;
            for (&wavelength, &intensity) in spectrum.wavelengths.iter().zip(&spectrum.values) {
                writer.serialize(SpectrumRow {
                    wavelength,
                    intensity,
                })?;
            }
            writer.flush()?;
            readings += 1;

            let elapsed = started.elapsed();
            if elapsed >= duration {
                break;
            }
            settle::pause(
                "blank reading",
                calibration.read_interval.min(duration - elapsed),
            )
            .await;
        }
        Ok(readings)
    }
}

impl Reactor<FlowExecutor> {
    /// Flush the coil with the liquid pumps and record raw spectra as a blank.
    ///
    /// Pumps 1 and 2 run at the maximum syringe rate for `turnovers` coil
    /// volumes while readings at `viewing_port` are appended to the blank
    /// CSV. The pumps are stopped afterwards, also on failure.
    #[instrument(skip(self))]
    pub async fn store_blank(&self, turnovers: u32, viewing_port: u32) -> AppResult<CommandAck> {
        if self.machine().status() == RunStatus::RunningProcedure {
            return Ok(CommandAck::Rejected(PROCEDURE_ALREADY_RUNNING.to_string()));
        }
        let _exclusive = self.exclusive_device_access().await;
        let executor = self.executor();
        let settings = executor.settings();
        let rate = settings.calibration.max_syringe_flow_rate_ul_per_hr;
        let flush = settings.geometry.flush_time(rate) * turnovers;
        info!(
            dead_volume_ul = settings.geometry.dead_volume_ul(),
            turnovers,
            flush = ?flush,
            "Flushing coil for blank"
        );

        let recorded = async {
            executor
                .start_flush(FlowRate::microliters_per_hour(rate))
                .await?;
            executor.go_to_port(viewing_port).await;
            executor.record_raw_readings(flush).await
        }
        .await;
        executor.stop_flush().await;

        let readings = recorded?;
        info!(
            readings,
            path = %settings.calibration.blank_output.display(),
            "Blank stored"
        );
        Ok(CommandAck::Accepted("Blank stored"))
    }

    /// Load blank and dark spectra from CSV into the spectrometer.
    pub async fn load_blank_and_dark(&self, blank_csv: &Path, dark_csv: &Path) -> AppResult<()> {
        let blank = read_spectrum_csv(blank_csv)?;
        let dark = read_spectrum_csv(dark_csv)?;
        if blank.len() != dark.len() {
            return Err(ReactorError::Validation(format!(
                "blank has {} points but dark has {}",
                blank.len(),
                dark.len()
            )));
        }

        let session = self
            .executor()
            .devices()
            .spectrometer()
            .await
            .map_err(|e| ReactorError::device("spectrometer", e))?;
        session
            .store_blank(blank)
            .await
            .map_err(|e| ReactorError::device("spectrometer", e))?;
        session
            .store_dark(dark)
            .await
            .map_err(|e| ReactorError::device("spectrometer", e))?;
        info!(blank = %blank_csv.display(), dark = %dark_csv.display(), "Calibration loaded");
        Ok(())
    }

    /// Replace the stage positions. Refused while a run is active.
    pub fn set_stage_positions(&self, positions: Vec<f64>) -> AppResult<()> {
        if self.machine().is_running() {
            return Err(ReactorError::RunActive);
        }
        if positions.is_empty() {
            return Err(ReactorError::Validation("no stage positions given".into()));
        }
        if let Some(bad) = positions.iter().find(|p| !p.is_finite()) {
            return Err(ReactorError::Validation(format!(
                "stage position {bad} is not a number"
            )));
        }
        self.executor().replace_stage_positions(positions);
        Ok(())
    }

    /// Load stage positions from the `stage_positions` column of a CSV.
    pub fn load_stage_positions(&self, path: &Path) -> AppResult<()> {
        if self.machine().is_running() {
            return Err(ReactorError::RunActive);
        }
        let positions = read_stage_positions_csv(path)?;
        self.set_stage_positions(positions)
    }

    /// Find viewing positions by scanning the stage for intensity above
    /// `threshold`.
    pub async fn locate_stage_positions(&self, _threshold: f64) -> AppResult<Vec<f64>> {
        Err(ReactorError::NotImplemented("automatic stage position location"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowReactor, FlowSettings};
    use crate::hardware::mock::MockDevices;
    use crate::reactor::ReactorIdentity;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn reactor(mocks: &MockDevices, settings: FlowSettings) -> FlowReactor {
        FlowReactor::flow(
            ReactorIdentity::new("reactor-1", "192.168.1.1"),
            mocks.devices(),
            settings,
        )
    }

    fn csv_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn repeated_readings_are_averaged() {
        let file = csv_file("wavelength,intensity\n400,10\n500,20\n400,30\n500,40\n");
        let spectrum = read_spectrum_csv(file.path()).unwrap();
        assert_eq!(spectrum.wavelengths, vec![400.0, 500.0]);
        assert_eq!(spectrum.values, vec![20.0, 30.0]);
    }

    #[test]
    fn empty_spectrum_file_is_rejected() {
        let file = csv_file("wavelength,intensity\n");
        assert!(matches!(
            read_spectrum_csv(file.path()),
            Err(ReactorError::Validation(_))
        ));
    }

    #[test]
    fn stage_positions_read_from_named_column() {
        let file = csv_file("port,stage_positions\n1,12.5\n2,25.0\n");
        let positions = read_stage_positions_csv(file.path()).unwrap();
        assert_eq!(positions, vec![12.5, 25.0]);
    }

    #[tokio::test]
    async fn store_blank_writes_one_header_and_stops_pumps() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("blank.csv");
        let mut settings = FlowSettings::immediate();
        settings.calibration.blank_output = output.clone();
        // Flush time rounds to nothing, so one reading per call.
        settings.calibration.max_syringe_flow_rate_ul_per_hr = f64::MAX;

        let mocks = MockDevices::new();
        let reactor = reactor(&mocks, settings);
        reactor.set_stage_positions(vec![10.0, 20.0]).unwrap();

        for _ in 0..2 {
            let ack = reactor.store_blank(1, 2).await.unwrap();
            assert!(ack.is_accepted());
        }

        let text = std::fs::read_to_string(&output).unwrap();
        assert_eq!(text.matches("wavelength,intensity").count(), 1);
        assert!(!mocks.pump_1.is_running().await);
        assert!(!mocks.pump_2.is_running().await);
        assert_eq!(mocks.stage.moves(), vec![20.0, 20.0]);
        assert_eq!(mocks.spectrometer.open_count(), mocks.spectrometer.close_count());

        let blank = read_spectrum_csv(&output).unwrap();
        assert_eq!(blank.len(), 1024);
    }

    #[tokio::test]
    async fn blank_and_dark_reach_the_spectrometer() {
        let blank = csv_file("wavelength,intensity\n400,1000\n500,1200\n");
        let dark = csv_file("wavelength,intensity\n400,100\n500,100\n");
        let mocks = MockDevices::new();
        let reactor = reactor(&mocks, FlowSettings::immediate());

        reactor
            .load_blank_and_dark(blank.path(), dark.path())
            .await
            .unwrap();

        assert_eq!(mocks.spectrometer.blank().unwrap().values, vec![1000.0, 1200.0]);
        assert_eq!(mocks.spectrometer.dark().unwrap().values, vec![100.0, 100.0]);
        assert!(!mocks.spectrometer.is_open());
    }

    #[tokio::test]
    async fn stage_positions_cannot_be_empty() {
        let mocks = MockDevices::new();
        let reactor = reactor(&mocks, FlowSettings::immediate());
        assert!(matches!(
            reactor.set_stage_positions(Vec::new()),
            Err(ReactorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn locating_positions_is_not_implemented() {
        let mocks = MockDevices::new();
        let reactor = reactor(&mocks, FlowSettings::immediate());
        assert!(matches!(
            reactor.locate_stage_positions(0.5).await,
            Err(ReactorError::NotImplemented(_))
        ));
    }
}
