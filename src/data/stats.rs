//! Summary statistics over a window of samples.
//!
//! The raw values of a window are centered on their arithmetic mean and made
//! absolute before `min`, `mean` and `max` are taken, so the record describes the
//! amplitude of the signal around its offset rather than the offset itself.

use std::fmt::Write as _;

/// One raw measurement value with the timestamp of the datagram it came in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Seconds since the Unix epoch, as sent by the data source
    pub timestamp: f64,
    /// Raw integer value
    pub value: i64,
}

impl Sample {
    /// Create a sample.
    pub fn new(timestamp: f64, value: i64) -> Self {
        Self { timestamp, value }
    }
}

/// Statistics of one flushed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryRecord {
    /// Earliest sample timestamp
    pub first_timestamp: f64,
    /// Latest sample timestamp
    pub last_timestamp: f64,
    /// Number of samples in the window
    pub count: usize,
    /// Smallest centered amplitude
    pub min: i64,
    /// Mean centered amplitude
    pub mean: i64,
    /// Largest centered amplitude
    pub max: i64,
}

/// Compute the summary of `samples`, or `None` when there are none.
///
/// `min`, `mean` and `max` are truncated toward zero. `first_timestamp` and
/// `last_timestamp` are the smallest and largest timestamps, independent of
/// arrival order.
pub fn summarize(samples: &[Sample]) -> Option<SummaryRecord> {
    if samples.is_empty() {
        return None;
    }

    let count = samples.len();
    let n = count as f64;
    let offset = samples.iter().map(|s| s.value as f64).sum::<f64>() / n;

    let mut first_timestamp = f64::INFINITY;
    let mut last_timestamp = f64::NEG_INFINITY;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;

    for sample in samples {
        first_timestamp = first_timestamp.min(sample.timestamp);
        last_timestamp = last_timestamp.max(sample.timestamp);

        let centered = (sample.value as f64 - offset).abs();
        min = min.min(centered);
        max = max.max(centered);
        sum += centered;
    }

    Some(SummaryRecord {
        first_timestamp,
        last_timestamp,
        count,
        min: min.trunc() as i64,
        mean: (sum / n).trunc() as i64,
        max: max.trunc() as i64,
    })
}

/// Render a timestamp the way the downstream consumer expects.
///
/// Shortest round-trip decimal form, except that whole numbers keep a trailing
/// `.0` (`2.0`, not `2`).
pub fn format_timestamp(timestamp: f64) -> String {
    if timestamp.is_finite() && timestamp.fract() == 0.0 && timestamp.abs() < 1e16 {
        format!("{timestamp:.1}")
    } else {
        timestamp.to_string()
    }
}

/// Build the wire line `channel;first;last;count;min;mean;max\n`.
pub fn format_message(channel_id: &str, record: &SummaryRecord) -> String {
    let mut line = String::with_capacity(channel_id.len() + 64);
    line.push_str(channel_id);
    // Writing into a String cannot fail.
    let _ = writeln!(
        line,
        ";{};{};{};{};{};{}",
        format_timestamp(record.first_timestamp),
        format_timestamp(record.last_timestamp),
        record.count,
        record.min,
        record.mean,
        record.max,
    );
    line
}

/// Summarize and format in one step; `None` for an empty window.
pub fn generate_message(channel_id: &str, samples: &[Sample]) -> Option<String> {
    summarize(samples).map(|record| format_message(channel_id, &record))
}
