//! Spectral records and the buffer that hands them to the caller.
//!
//! Steps push one [`SpectrumRecord`] per measured stage position; remote
//! callers drain them with [`SpectrumBuffer::get`]. Each record is handed out
//! exactly once, oldest first.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{AppResult, ReactorError};
use crate::hardware::capabilities::Spectrum;

/// Leading detector points discarded from every absorbance read.
pub const DEFAULT_SPECTRAL_CUTOFF: usize = 300;

/// One measurement taken at one stage position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumRecord {
    /// Procedure run id; `None` for single instructions.
    pub run_id: Option<String>,
    /// Step number the measurement belongs to (1-based).
    pub step: u32,
    /// Stage coordinate the probe was at.
    pub stage_position: f64,
    /// Residence time in seconds. Not computed by the engine.
    pub residence_time: Option<f64>,
    /// Wavelength axis in nm.
    pub wavelengths: Vec<f64>,
    /// Absorbance values, when absorbance was measured.
    pub absorbance: Option<Vec<f64>>,
    /// Fluorescence values, when fluorescence was measured.
    pub fluorescence: Option<Vec<f64>>,
    /// Acquisition time.
    pub timestamp: DateTime<Utc>,
}

impl SpectrumRecord {
    /// Record for a position; `absorbance` carries the wavelength axis too.
    pub fn new(
        run_id: Option<String>,
        step: u32,
        stage_position: f64,
        absorbance: Option<Spectrum>,
    ) -> Self {
        let (wavelengths, absorbance) = match absorbance {
            Some(spectrum) => (spectrum.wavelengths, Some(spectrum.values)),
            None => (Vec::new(), None),
        };
        Self {
            run_id,
            step,
            stage_position,
            residence_time: None,
            wavelengths,
            absorbance,
            fluorescence: None,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of a spectrum request.
#[derive(Debug, Clone, PartialEq)]
pub enum SpectrumPoll {
    /// The oldest buffered record.
    Record(SpectrumRecord),
    /// Non-blocking request and nothing was buffered.
    Empty,
    /// Blocking request and nothing arrived before the deadline.
    TimedOut,
}

impl SpectrumPoll {
    /// The record, if one was returned.
    pub fn into_record(self) -> Option<SpectrumRecord> {
        match self {
            SpectrumPoll::Record(record) => Some(record),
            SpectrumPoll::Empty | SpectrumPoll::TimedOut => None,
        }
    }
}

/// Unbounded FIFO of spectrum records shared between steps and callers.
#[derive(Debug, Default)]
pub struct SpectrumBuffer {
    records: Mutex<VecDeque<SpectrumRecord>>,
    arrived: Notify,
}

impl SpectrumBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and wake blocked readers.
    pub fn push(&self, record: SpectrumRecord) {
        self.records.lock().push_back(record);
        self.arrived.notify_waiters();
    }

    /// Remove and return the oldest record, if any.
    pub fn try_pop(&self) -> Option<SpectrumRecord> {
        self.records.lock().pop_front()
    }

    /// Wait up to `timeout` for a record.
    ///
    /// Returns immediately when one is already buffered.
    /// A timeout too large to represent as a deadline waits without bound.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<SpectrumRecord> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and await is not lost.
            notified.as_mut().enable();

            if let Some(record) = self.try_pop() {
                return Some(record);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Blocking or non-blocking retrieval.
    pub async fn get(&self, blocking: bool, timeout: Duration) -> SpectrumPoll {
        if blocking {
            match self.pop_timeout(timeout).await {
                Some(record) => SpectrumPoll::Record(record),
                None => SpectrumPoll::TimedOut,
            }
        } else {
            match self.try_pop() {
                Some(record) => SpectrumPoll::Record(record),
                None => SpectrumPoll::Empty,
            }
        }
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drop every buffered record, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut records = self.records.lock();
        let discarded = records.len();
        records.clear();
        discarded
    }
}

/// Convert averaged sample intensities to absorbance.
///
/// `A = log10((blank - dark) / (sample - dark))`, starting at index `cutoff`.
/// Points where the ratio is not a finite positive number are dropped along
/// with their wavelength, so the returned arrays always pair up.
pub fn compute_absorbance(
    blank: &Spectrum,
    dark: &Spectrum,
    scans: &[Vec<f64>],
    cutoff: usize,
    normalized: bool,
) -> AppResult<Spectrum> {
    let Some(first) = scans.first() else {
        return Err(ReactorError::Validation(
            "at least one scan is required".to_string(),
        ));
    };
    let n = blank.len();
    if dark.len() != n || first.len() != n || blank.values.len() != n || dark.values.len() != n {
        return Err(ReactorError::Validation(format!(
            "spectrum length mismatch: blank {}, dark {}, sample {}",
            n,
            dark.len(),
            first.len()
        )));
    }
    if scans.iter().any(|scan| scan.len() != n) {
        return Err(ReactorError::Validation(
            "scans differ in length".to_string(),
        ));
    }

    let count = scans.len() as f64;
    let mut result = Spectrum::default();
    for i in cutoff.min(n)..n {
        let sample = scans.iter().map(|scan| scan[i]).sum::<f64>() / count;
        let reference = blank.values[i] - dark.values[i];
        let measured = sample - dark.values[i];
        let absorbance = (reference / measured).log10();
        if absorbance.is_finite() {
            result.wavelengths.push(blank.wavelengths[i]);
            result.values.push(absorbance);
        }
    }

    if normalized {
        let max = result.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max.is_finite() && max > 0.0 {
            result.values.iter_mut().for_each(|value| *value /= max);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u32) -> SpectrumRecord {
        SpectrumRecord::new(Some("run".into()), step, 1.5, None)
    }

    #[tokio::test]
    async fn non_blocking_get_on_empty_buffer_is_empty() {
        let buffer = SpectrumBuffer::new();
        assert_eq!(
            buffer.get(false, Duration::from_secs(1)).await,
            SpectrumPoll::Empty
        );
    }

    #[tokio::test]
    async fn records_come_out_in_push_order() {
        let buffer = SpectrumBuffer::new();
        buffer.push(record(1));
        buffer.push(record(2));
        buffer.push(record(3));

        let steps: Vec<u32> = std::iter::from_fn(|| buffer.try_pop())
            .map(|r| r.step)
            .collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn blocking_get_times_out() {
        let buffer = SpectrumBuffer::new();
        let started = std::time::Instant::now();
        let poll = buffer.get(true, Duration::from_millis(50)).await;
        assert_eq!(poll, SpectrumPoll::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blocking_get_wakes_on_push() {
        let buffer = std::sync::Arc::new(SpectrumBuffer::new());
        let producer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(record(7));
        });

        let poll = buffer.get(true, Duration::from_secs(5)).await;
        assert_eq!(poll.into_record().map(|r| r.step), Some(7));
    }

    #[tokio::test]
    async fn blocking_get_returns_oldest_buffered_record_at_once() {
        let buffer = SpectrumBuffer::new();
        buffer.push(record(1));
        buffer.push(record(2));

        let started = std::time::Instant::now();
        let poll = buffer.get(true, Duration::from_secs(5)).await;
        assert_eq!(poll.into_record().map(|r| r.step), Some(1));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn unbounded_timeout_returns_buffered_record() {
        let buffer = SpectrumBuffer::new();
        buffer.push(record(3));

        let poll = buffer.get(true, Duration::MAX).await;
        assert_eq!(poll.into_record().map(|r| r.step), Some(3));
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_for_push() {
        let buffer = SpectrumBuffer::new();
        let mut pop = tokio_test::task::spawn(buffer.pop_timeout(Duration::MAX));
        tokio_test::assert_pending!(pop.poll());

        buffer.push(record(5));
        let popped = tokio_test::assert_ready!(pop.poll());
        assert_eq!(popped.map(|r| r.step), Some(5));
    }

    #[tokio::test]
    async fn pending_pop_is_woken_by_push() {
        let buffer = SpectrumBuffer::new();
        let mut pop = tokio_test::task::spawn(buffer.pop_timeout(Duration::from_secs(5)));
        tokio_test::assert_pending!(pop.poll());

        buffer.push(record(4));
        assert!(pop.is_woken());
        let popped = tokio_test::assert_ready!(pop.poll());
        assert_eq!(popped.map(|r| r.step), Some(4));
    }

    #[test]
    fn clear_reports_discarded_count() {
        let buffer = SpectrumBuffer::new();
        buffer.push(record(1));
        buffer.push(record(2));
        assert_eq!(buffer.clear(), 2);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn absorbance_of_tenfold_attenuation_is_one() {
        let wavelengths = vec![400.0, 500.0, 600.0];
        let blank = Spectrum {
            wavelengths: wavelengths.clone(),
            values: vec![1010.0, 1010.0, 1010.0],
        };
        let dark = Spectrum {
            wavelengths,
            values: vec![10.0, 10.0, 10.0],
        };
        let scans = vec![vec![110.0, 110.0, 1010.0], vec![110.0, 110.0, 1010.0]];

        let result = compute_absorbance(&blank, &dark, &scans, 1, false).unwrap();
        assert_eq!(result.wavelengths, vec![500.0, 600.0]);
        assert!((result.values[0] - 1.0).abs() < 1e-12);
        assert!(result.values[1].abs() < 1e-12);
    }

    #[test]
    fn non_finite_points_are_dropped_with_their_wavelength() {
        let blank = Spectrum {
            wavelengths: vec![1.0, 2.0],
            values: vec![100.0, 100.0],
        };
        let dark = Spectrum {
            wavelengths: vec![1.0, 2.0],
            values: vec![0.0, 0.0],
        };
        // Second point equals dark: division by zero.
        let scans = vec![vec![10.0, 0.0]];
        let result = compute_absorbance(&blank, &dark, &scans, 0, true).unwrap();
        assert_eq!(result.wavelengths, vec![1.0]);
        assert_eq!(result.values, vec![1.0]);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let blank = Spectrum {
            wavelengths: vec![1.0, 2.0],
            values: vec![1.0, 1.0],
        };
        let dark = Spectrum::default();
        let err = compute_absorbance(&blank, &dark, &[vec![1.0, 1.0]], 0, false).unwrap_err();
        assert!(matches!(err, ReactorError::Validation(_)));
    }
}
